pub(crate) mod logging;

pub(crate) mod net;

pub(crate) mod operators;

pub(crate) mod owner;

pub(crate) mod unit;

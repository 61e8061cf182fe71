use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::thread;
use std::time::{Duration, Instant};

use dataflow_rs::config::ChannelConfiguration;
use dataflow_rs::processing::OperatorStaticInformation;
use dataflow_rs::types::OperatorId;

pub(crate) const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Bind a listener on an ephemeral localhost port.
pub(crate) fn localhost_listener() -> TcpListener {
    TcpListener::bind((LOCALHOST, 0)).unwrap()
}

/// Get a localhost port nothing listens on (as long as nobody else grabs it in the meantime).
pub(crate) fn unused_port() -> u16 {
    let listener = localhost_listener();
    listener.local_addr().unwrap().port()
}

pub(crate) fn operator_at(op_id: u32, data_port: u16, control_port: u16) -> OperatorStaticInformation {
    OperatorStaticInformation::new(OperatorId::new(op_id), LOCALHOST, data_port, control_port)
}

pub(crate) fn channel_config(batch_limit: usize) -> ChannelConfiguration {
    ChannelConfiguration {
        batch_limit,
        socket_send_buffer_size: 64 * 1024,
        control_socket_wait: Duration::from_secs(5),
        output_buffer_capacity: 10_000,
    }
}

/// Poll `condition` every few milliseconds until it holds or `timeout` elapses. Returns whether it held.
pub(crate) fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The event bus thread, which receives [events](crate::events) from processing units and channels and
//! fires the handlers registered for each kind of event.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::events::*;
use crate::logging::Logger;

pub type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Handler closures for every kind of event, fired in registration order.
///
/// If `log_events` is set when creating the handlers, the default [logging](crate::logging) handler of
/// every event kind is registered first.
#[derive(Default)]
pub struct EventHandlers {
    pub(crate) start_checkpoint_handlers: Vec<HandlerPtr<StartCheckpointEvent>>,
    pub(crate) end_checkpoint_handlers: Vec<HandlerPtr<EndCheckpointEvent>>,
    pub(crate) send_backup_handlers: Vec<HandlerPtr<SendBackupEvent>>,
    pub(crate) stream_chunk_handlers: Vec<HandlerPtr<StreamChunkEvent>>,
    pub(crate) complete_streaming_handlers: Vec<HandlerPtr<CompleteStreamingEvent>>,
    pub(crate) reconcile_state_handlers: Vec<HandlerPtr<ReconcileStateEvent>>,
    pub(crate) install_state_handlers: Vec<HandlerPtr<InstallStateEvent>>,
    pub(crate) reconnect_data_link_handlers: Vec<HandlerPtr<ReconnectDataLinkEvent>>,
    pub(crate) connect_control_link_handlers: Vec<HandlerPtr<ConnectControlLinkEvent>>,
    pub(crate) flush_batch_handlers: Vec<HandlerPtr<FlushBatchEvent>>,
    pub(crate) routing_error_handlers: Vec<HandlerPtr<RoutingErrorEvent>>,
    pub(crate) emit_ack_handlers: Vec<HandlerPtr<EmitAckEvent>>,
    pub(crate) drop_tuples_handlers: Vec<HandlerPtr<DropTuplesEvent>>,
}

impl EventHandlers {
    pub fn new(log_events: bool) -> Self {
        let mut handlers = Self::default();
        if log_events {
            handlers.start_checkpoint_handlers.push(StartCheckpointEvent::get_logger());
            handlers.end_checkpoint_handlers.push(EndCheckpointEvent::get_logger());
            handlers.send_backup_handlers.push(SendBackupEvent::get_logger());
            handlers.stream_chunk_handlers.push(StreamChunkEvent::get_logger());
            handlers.complete_streaming_handlers.push(CompleteStreamingEvent::get_logger());
            handlers.reconcile_state_handlers.push(ReconcileStateEvent::get_logger());
            handlers.install_state_handlers.push(InstallStateEvent::get_logger());
            handlers.reconnect_data_link_handlers.push(ReconnectDataLinkEvent::get_logger());
            handlers.connect_control_link_handlers.push(ConnectControlLinkEvent::get_logger());
            handlers.flush_batch_handlers.push(FlushBatchEvent::get_logger());
            handlers.routing_error_handlers.push(RoutingErrorEvent::get_logger());
            handlers.emit_ack_handlers.push(EmitAckEvent::get_logger());
            handlers.drop_tuples_handlers.push(DropTuplesEvent::get_logger());
        }
        handlers
    }

    pub fn on_start_checkpoint(mut self, handler: impl Fn(&StartCheckpointEvent) + Send + 'static) -> Self {
        self.start_checkpoint_handlers.push(Box::new(handler));
        self
    }

    pub fn on_end_checkpoint(mut self, handler: impl Fn(&EndCheckpointEvent) + Send + 'static) -> Self {
        self.end_checkpoint_handlers.push(Box::new(handler));
        self
    }

    pub fn on_send_backup(mut self, handler: impl Fn(&SendBackupEvent) + Send + 'static) -> Self {
        self.send_backup_handlers.push(Box::new(handler));
        self
    }

    pub fn on_stream_chunk(mut self, handler: impl Fn(&StreamChunkEvent) + Send + 'static) -> Self {
        self.stream_chunk_handlers.push(Box::new(handler));
        self
    }

    pub fn on_complete_streaming(mut self, handler: impl Fn(&CompleteStreamingEvent) + Send + 'static) -> Self {
        self.complete_streaming_handlers.push(Box::new(handler));
        self
    }

    pub fn on_reconcile_state(mut self, handler: impl Fn(&ReconcileStateEvent) + Send + 'static) -> Self {
        self.reconcile_state_handlers.push(Box::new(handler));
        self
    }

    pub fn on_install_state(mut self, handler: impl Fn(&InstallStateEvent) + Send + 'static) -> Self {
        self.install_state_handlers.push(Box::new(handler));
        self
    }

    pub fn on_reconnect_data_link(mut self, handler: impl Fn(&ReconnectDataLinkEvent) + Send + 'static) -> Self {
        self.reconnect_data_link_handlers.push(Box::new(handler));
        self
    }

    pub fn on_connect_control_link(mut self, handler: impl Fn(&ConnectControlLinkEvent) + Send + 'static) -> Self {
        self.connect_control_link_handlers.push(Box::new(handler));
        self
    }

    pub fn on_flush_batch(mut self, handler: impl Fn(&FlushBatchEvent) + Send + 'static) -> Self {
        self.flush_batch_handlers.push(Box::new(handler));
        self
    }

    pub fn on_routing_error(mut self, handler: impl Fn(&RoutingErrorEvent) + Send + 'static) -> Self {
        self.routing_error_handlers.push(Box::new(handler));
        self
    }

    pub fn on_emit_ack(mut self, handler: impl Fn(&EmitAckEvent) + Send + 'static) -> Self {
        self.emit_ack_handlers.push(Box::new(handler));
        self
    }

    pub fn on_drop_tuples(mut self, handler: impl Fn(&DropTuplesEvent) + Send + 'static) -> Self {
        self.drop_tuples_handlers.push(Box::new(handler));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.start_checkpoint_handlers.is_empty()
            && self.end_checkpoint_handlers.is_empty()
            && self.send_backup_handlers.is_empty()
            && self.stream_chunk_handlers.is_empty()
            && self.complete_streaming_handlers.is_empty()
            && self.reconcile_state_handlers.is_empty()
            && self.install_state_handlers.is_empty()
            && self.reconnect_data_link_handlers.is_empty()
            && self.connect_control_link_handlers.is_empty()
            && self.flush_batch_handlers.is_empty()
            && self.routing_error_handlers.is_empty()
            && self.emit_ack_handlers.is_empty()
            && self.drop_tuples_handlers.is_empty()
    }

    pub fn fire_handlers(&self, event: Event) {
        match event {
            Event::StartCheckpoint(start_checkpoint_event) =>
                self.start_checkpoint_handlers.iter().for_each(|handler| handler(&start_checkpoint_event)),

            Event::EndCheckpoint(end_checkpoint_event) =>
                self.end_checkpoint_handlers.iter().for_each(|handler| handler(&end_checkpoint_event)),

            Event::SendBackup(send_backup_event) =>
                self.send_backup_handlers.iter().for_each(|handler| handler(&send_backup_event)),

            Event::StreamChunk(stream_chunk_event) =>
                self.stream_chunk_handlers.iter().for_each(|handler| handler(&stream_chunk_event)),

            Event::CompleteStreaming(complete_streaming_event) =>
                self.complete_streaming_handlers.iter().for_each(|handler| handler(&complete_streaming_event)),

            Event::ReconcileState(reconcile_state_event) =>
                self.reconcile_state_handlers.iter().for_each(|handler| handler(&reconcile_state_event)),

            Event::InstallState(install_state_event) =>
                self.install_state_handlers.iter().for_each(|handler| handler(&install_state_event)),

            Event::ReconnectDataLink(reconnect_data_link_event) =>
                self.reconnect_data_link_handlers.iter().for_each(|handler| handler(&reconnect_data_link_event)),

            Event::ConnectControlLink(connect_control_link_event) =>
                self.connect_control_link_handlers.iter().for_each(|handler| handler(&connect_control_link_event)),

            Event::FlushBatch(flush_batch_event) =>
                self.flush_batch_handlers.iter().for_each(|handler| handler(&flush_batch_event)),

            Event::RoutingError(routing_error_event) =>
                self.routing_error_handlers.iter().for_each(|handler| handler(&routing_error_event)),

            Event::EmitAck(emit_ack_event) =>
                self.emit_ack_handlers.iter().for_each(|handler| handler(&emit_ack_event)),

            Event::DropTuples(drop_tuples_event) =>
                self.drop_tuples_handlers.iter().for_each(|handler| handler(&drop_tuples_event)),
        }
    }
}

pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => {
                // Fire the handlers of events that were published before shutdown.
                while let Ok(event) = event_subscriber.try_recv() {
                    event_handlers.fire_handlers(event)
                }
                return;
            }
            Err(TryRecvError::Empty) => (),
        }

        match event_subscriber.recv_timeout(POLL_INTERVAL) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => (),
            // Every publisher is gone: nothing more will arrive.
            Err(RecvTimeoutError::Disconnected) => return,
        }
    })
}

/// Handle to a running event bus thread. When this value is dropped, the thread fires the handlers of
/// the events already published, and exits.
pub struct EventBus {
    thread: Option<JoinHandle<()>>,
    shutdown: Sender<()>,
}

impl EventBus {
    /// Start an event bus thread for `event_handlers`, returning its handle and the publisher end that
    /// processing units and channels send events into.
    pub fn start(event_handlers: EventHandlers) -> (EventBus, Sender<Event>) {
        let (event_publisher, event_subscriber) = mpsc::channel();
        let (shutdown, shutdown_receiver) = mpsc::channel();
        let thread = start_event_bus(event_handlers, event_subscriber, shutdown_receiver);
        (
            EventBus {
                thread: Some(thread),
                shutdown,
            },
            event_publisher,
        )
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

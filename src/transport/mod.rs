//! Sequencer transport boundary
//!
//! The engine talks to the outside world only through [`SequencerTransport`]:
//! - [`MidirTransport`] drives real devices through midir
//! - [`LoopbackTransport`] is an in-memory transport for tests and offline use
//!
//! Both keep their delivery clock in a [`SoftQueue`].

mod loopback;
mod midir_transport;
mod queue;

pub use self::loopback::{Delivery, LoopbackTransport};
pub use self::midir_transport::MidirTransport;
pub use self::queue::SoftQueue;

use crate::bus::BusMode;
use crate::error::Result;
use crossbeam::channel::Receiver;

/// Transport-side handle of an opened bus port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(pub u32);

/// Inbound bytes as handed over by the transport
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub port: PortId,
    pub data: Vec<u8>,
    /// Queue tick at reception
    pub tick: u64,
}

/// Foreign sequencer service: client, ports, subscriptions and a
/// tick-based delivery queue.
pub trait SequencerTransport: Send + Sync {
    /// Registers the client under `name`
    fn open_client(&self, name: &str) -> Result<()>;

    fn close_client(&self);

    fn client_name(&self) -> Option<String>;

    fn create_port(&self, name: &str, mode: BusMode) -> Result<PortId>;

    fn delete_port(&self, port: PortId);

    /// External endpoints a port of `mode` could be connected to
    fn endpoints(&self, mode: BusMode) -> Vec<String>;

    fn connect(&self, port: PortId, mode: BusMode, endpoint: &str) -> Result<()>;

    fn disconnect(&self, port: PortId, mode: BusMode, endpoint: &str) -> Result<()>;

    /// Endpoints currently connected to `port` on the `mode` side
    fn connections(&self, port: PortId, mode: BusMode) -> Vec<String>;

    /// Immediate, non-blocking send of one complete message
    fn send(&self, port: PortId, data: &[u8]) -> Result<()>;

    /// Data-ready channel carrying every inbound message
    fn input(&self) -> Receiver<RawEvent>;

    fn alloc_queue(&self) -> Result<()>;

    fn free_queue(&self);

    fn set_queue_tempo(&self, tempo: f32, ticks_per_beat: u16) -> Result<()>;

    fn start_queue(&self);

    fn stop_queue(&self);

    fn continue_queue(&self);

    fn queue_tick(&self) -> u64;

    fn queue_running(&self) -> bool;
}

//! Mixing engine - input slots, bus mixer, stream I/O, controller
//!
//! This module contains the real-time side of the mixer:
//! - InputChannel / OutputBus: per-slot parameters, latest blocks and meters
//! - Mixer: filters every input and sums it into the routed buses
//! - IoAdapter: turns stream callbacks into fixed-size blocks and back
//! - MixScheduler: fixed-period worker driving the mixer
//! - Engine: lifecycle, device selection and the UI-facing API

mod cell;
mod channel;
mod controller;
mod events;
mod io;
mod mixer;
mod scheduler;

pub use cell::*;
pub use channel::*;
pub use controller::{Engine, EngineState};
pub use events::*;
pub use io::*;
pub use mixer::*;
pub use scheduler::MixScheduler;

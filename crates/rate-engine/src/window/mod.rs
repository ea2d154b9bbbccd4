//! Window synchronization of raw ticks across providers.

mod synchronizer;

pub use synchronizer::{
    CompletedWindow, SweepStats, WindowSettings, WindowSnapshot, WindowSynchronizer,
};

//! Needle driver runtime: synthesis, sink supervision and the producers
//! that feed the playback state.
pub mod backoff;
pub mod metrics;
pub mod playback;
pub mod poller;
pub mod sink;
pub mod supervisor;
pub mod synth;

//! Sampling collectors.
//!
//! The [`sampler_worker`] drives everything: it triggers periodic samples
//! via signals, fans GC and allocation events into the
//! [`thread_context`] collector, and paces itself with the
//! [`dynamic_sampling_rate`] and [`discrete_dynamic_sampler`] controllers.
//! The [`stack`] collector turns individual threads' frame chains into
//! recorded samples.

pub mod discrete_dynamic_sampler;
pub mod dynamic_sampling_rate;
pub mod sampler_worker;
pub mod stack;
pub mod thread_context;

//! End-to-end tests over in-memory upstreams and a scripted webhook.

mod delivery;
mod fakes;
mod pipeline;

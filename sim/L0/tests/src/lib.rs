//! Integration test crate for `sim-softbody` and `sim-shm`.
//!
//! All tests live under `integration/`; this library is intentionally empty.

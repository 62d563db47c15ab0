pub mod lifecycle;
pub mod monitor;
pub mod position;
pub mod registry;
pub mod route;
pub mod sos;
pub mod throttle;
pub mod watchdog;

#[cfg(test)]
pub(crate) mod testing;

pub mod contact;
pub mod position;
pub mod route;
pub mod sos;
pub mod trip;

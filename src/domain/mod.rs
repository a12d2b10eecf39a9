//! Domain Layer
//!
//! Entities, value objects, pure services and the ports the
//! infrastructure implements.

pub mod entities;
pub mod ports;
pub mod services;
pub mod value_objects;

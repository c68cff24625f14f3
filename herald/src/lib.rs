pub mod bridge;
pub mod controller;
pub mod loopback;

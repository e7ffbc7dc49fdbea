pub mod cluster;
pub mod control;
pub mod local;
pub mod rewrite;
pub mod session;

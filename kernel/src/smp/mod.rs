pub mod cpu;
pub mod topology;

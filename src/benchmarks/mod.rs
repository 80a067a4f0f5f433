pub mod dot_benchmark;

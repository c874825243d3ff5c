pub mod cache_sweep;

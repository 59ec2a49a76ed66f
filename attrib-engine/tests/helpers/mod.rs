//! Test Helper Utilities
//!
//! Shared fixtures for attrib-engine integration tests

#![allow(dead_code)]

pub mod fixtures;
pub mod stub_geo;

pub use fixtures::{
    base_time, build, engine_with, geo_window, put_conversion, put_visit, read_conversion,
    test_config, visit,
};
pub use stub_geo::{StubGeoProvider, UnavailableGeoProvider};

#![doc = include_str!("../README.md")]

pub mod context;

pub use context::{
    ContextTracker, ContextTracking, DecodedContext, Error, Result, TrackerConfig, TrackerFactory,
};

#![deny(clippy::all)]

pub mod config;
pub mod error;
pub mod imaging;
pub mod inference;
pub mod reporting;
pub mod web;

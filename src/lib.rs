#[macro_use]
extern crate log;
#[macro_use]
extern crate derive_builder;
#[macro_use]
extern crate lazy_static;

pub mod browser_controller;
pub mod decoder;
pub mod dispatcher;
pub mod extractor;
pub mod html;
pub mod jsonld;
pub mod payload;
pub mod types;
pub mod utils;
pub mod watcher;
pub mod wire;

mod engine;
mod languages;
mod model;
mod reconciler;
mod references;
mod report;
mod scanner;

// Catalog backends and the trait the reconciler talks to
mod catalog;

pub use scanner::FunctionDoc;

// Export the main engine
pub use engine::Engine;

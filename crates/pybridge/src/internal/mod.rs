pub mod guest;
pub mod module;
pub mod output;
pub mod resource;
pub mod state;

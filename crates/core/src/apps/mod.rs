//! Built-in apps

pub mod comfyui;

pub use comfyui::Comfyui;

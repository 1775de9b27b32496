//! Model client implementations for Kestrel.
//!
//! All providers implement the `kestrel_core::Provider` trait.

pub mod openai_compat;

pub use openai_compat::OpenAiCompatProvider;

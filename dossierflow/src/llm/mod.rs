//! Generative service clients.

mod http;

pub use http::{classify_status, extract_text, HttpGenerativeClient, API_KEY_VAR, DEFAULT_BASE_URL};

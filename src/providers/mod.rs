pub mod summarizer;

pub use summarizer::{HttpSummarizer, Summarizer};

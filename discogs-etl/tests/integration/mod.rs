mod common;
mod extractor_test;
mod pipeline_test;

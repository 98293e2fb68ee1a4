//! Shared fixtures of the micro-transport benchmarks.

/// A named benchmark input.
#[derive(Debug, Copy, Clone)]
pub struct TestCase {
    name: &'static str,
    file: TestFile,
}

impl TestCase {
    pub const fn new(name: &'static str, file: TestFile) -> Self {
        Self { name, file }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn file(&self) -> &TestFile {
        &self.file
    }
}

/// Content of a file under `resources/`, embedded at compile time.
#[derive(Debug, Copy, Clone)]
pub struct TestFile {
    file_name: &'static str,
    content: &'static str,
}

impl TestFile {
    pub const fn new(file_name: &'static str, content: &'static str) -> Self {
        Self { file_name, content }
    }

    pub fn content(&self) -> &'static str {
        self.content
    }

    pub fn file_name(&self) -> &'static str {
        self.file_name
    }
}

/// A body of `len` bytes that compresses about as well as structured text does.
pub fn text_payload(len: usize) -> Vec<u8> {
    const WORDS: [&str; 8] = ["entity", "stream", "filter", "chain", "pool", "transport", "request", "response"];
    let mut payload = Vec::with_capacity(len + 16);
    let mut i = 0usize;
    while payload.len() < len {
        payload.extend_from_slice(WORDS[i % WORDS.len()].as_bytes());
        payload.push(if i % 7 == 0 { b'\n' } else { b' ' });
        i = i.wrapping_mul(31).wrapping_add(17) % 1009;
    }
    payload.truncate(len);
    payload
}

/// Sizes of the bodies the stream and codec benchmarks run over.
pub const PAYLOAD_SIZES: [usize; 3] = [1024, 64 * 1024, 1024 * 1024];

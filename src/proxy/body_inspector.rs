use bytes::Bytes;
use pingora::{Error, ErrorType};

/// Holds back a request body until it has been evaluated.
pub struct BodyInspector {
    max_body_size: usize,
    buffer: Vec<u8>,
}

impl BodyInspector {
    pub fn new(max_body_size: usize) -> Self {
        Self {
            max_body_size,
            buffer: Vec::new(),
        }
    }

    pub fn append_chunk(&mut self, chunk: &Bytes) -> Result<(), Box<Error>> {
        if self.buffer.len() + chunk.len() > self.max_body_size {
            return Err(Error::explain(
                ErrorType::HTTPStatus(403),
                format!(
                    "Request body exceeds maximum size of {} bytes",
                    self.max_body_size
                ),
            ));
        }

        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn body(&self) -> &[u8] {
        &self.buffer
    }

    /// Hand the buffered body on, leaving the inspector empty.
    pub fn take_body(&mut self) -> Bytes {
        Bytes::from(std::mem::take(&mut self.buffer))
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulates_chunks() {
        let mut inspector = BodyInspector::new(16);
        inspector.append_chunk(&Bytes::from_static(b"{\"query\":")).unwrap();
        inspector.append_chunk(&Bytes::from_static(b"\"{a}\"}")).unwrap();
        assert_eq!(inspector.body(), b"{\"query\":\"{a}\"}");
        assert_eq!(inspector.len(), 15);
    }

    #[test]
    fn test_rejects_oversized_body() {
        let mut inspector = BodyInspector::new(8);
        inspector.append_chunk(&Bytes::from_static(b"12345678")).unwrap();
        assert!(inspector.append_chunk(&Bytes::from_static(b"9")).is_err());
        assert_eq!(inspector.len(), 8);
    }

    #[test]
    fn test_take_body_empties_buffer() {
        let mut inspector = BodyInspector::new(8);
        inspector.append_chunk(&Bytes::from_static(b"abc")).unwrap();
        assert_eq!(inspector.take_body(), Bytes::from_static(b"abc"));
        assert!(inspector.is_empty());
    }
}

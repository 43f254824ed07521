//! Generic buffered, seekable input.
//!
//! [`BufferedInput`] owns the read cursor and the resident buffer window and
//! delegates window refills to a [`FillSource`]. Reads that hit the window
//! never touch the source; a miss triggers exactly one fill, then the read is
//! satisfied from the fresh window.

use async_trait::async_trait;

use super::InputError;

/// File-relative byte range currently resident in memory.
///
/// Maintains `start <= end` with `data.len() == end - start`. A filled
/// window only ever contains bytes that were readable at fill time.
#[derive(Debug, Default)]
pub struct BufferWindow {
    start: u64,
    end: u64,
    data: Vec<u8>,
}

impl BufferWindow {
    /// Creates an empty window containing no bytes.
    pub fn empty() -> Self {
        Self::default()
    }

    /// First resident file-relative offset.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// One past the last resident file-relative offset.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Number of resident bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the window holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether `position` is resident.
    pub fn contains(&self, position: u64) -> bool {
        self.start <= position && position < self.end
    }

    /// Replaces the window contents in one step.
    pub fn set(&mut self, start: u64, data: Vec<u8>) {
        self.start = start;
        self.end = start + data.len() as u64;
        self.data = data;
    }

    /// Drops all resident bytes.
    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
        self.data.clear();
    }

    /// Resident bytes from `position` to the end of the window, or an empty
    /// slice when `position` is not resident.
    pub fn slice_from(&self, position: u64) -> &[u8] {
        if !self.contains(position) {
            return &[];
        }
        &self.data[(position - self.start) as usize..]
    }
}

/// Supplier of buffer refills for a [`BufferedInput`].
#[async_trait]
pub trait FillSource: Send {
    /// Total logical size in bytes; constant for the source's lifetime.
    fn len(&self) -> u64;

    /// Repopulates `window` so that it contains the byte at `position`.
    ///
    /// May suspend. On error the window must either be left untouched or
    /// cleared, never describe bytes that were not read.
    ///
    /// # Errors
    ///
    /// Implementation-specific; see [`InputError`].
    async fn fill(&mut self, position: u64, window: &mut BufferWindow) -> Result<(), InputError>;

    /// Releases underlying resources.
    ///
    /// # Errors
    ///
    /// - `InputError::Io` - Resource teardown failed
    async fn close(&mut self) -> Result<(), InputError>;
}

/// Buffered, seekable reader over a [`FillSource`].
#[derive(Debug)]
pub struct BufferedInput<F> {
    source: F,
    window: BufferWindow,
    position: u64,
    len: u64,
    closed: bool,
}

impl<F: FillSource> BufferedInput<F> {
    /// Wraps a fill source with an empty buffer and the cursor at zero.
    pub fn new(source: F) -> Self {
        let len = source.len();
        Self {
            source,
            window: BufferWindow::empty(),
            position: 0,
            len,
            closed: false,
        }
    }

    /// Current file-relative read cursor.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Total logical size in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the input holds no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Repositions the cursor. The buffer window is kept; a following read
    /// inside the window costs no I/O.
    ///
    /// # Errors
    ///
    /// - `InputError::OutOfRange` - `offset` is beyond `len`
    pub fn seek(&mut self, offset: u64) -> Result<(), InputError> {
        if offset > self.len {
            return Err(InputError::OutOfRange {
                offset,
                len: self.len,
            });
        }
        self.position = offset;
        Ok(())
    }

    /// Reads up to `out.len()` bytes at the cursor, advancing it.
    ///
    /// Returns `Ok(0)` only at end of input (or for an empty `out`);
    /// otherwise at least one byte is returned, possibly fewer than
    /// requested. May suspend while the source fills the buffer.
    ///
    /// # Errors
    ///
    /// - `InputError::Closed` - The input was closed
    /// - Any error from [`FillSource::fill`]
    pub async fn read(&mut self, out: &mut [u8]) -> Result<usize, InputError> {
        if self.closed {
            return Err(InputError::Closed);
        }
        if self.position == self.len || out.is_empty() {
            return Ok(0);
        }
        if !self.window.contains(self.position) {
            self.source.fill(self.position, &mut self.window).await?;
            debug_assert!(
                self.window.contains(self.position),
                "fill must make the cursor byte resident"
            );
        }

        let resident = self.window.slice_from(self.position);
        let count = resident.len().min(out.len());
        out[..count].copy_from_slice(&resident[..count]);
        self.position += count as u64;
        Ok(count)
    }

    /// Closes the input and releases the source. Idempotent.
    ///
    /// # Errors
    ///
    /// - Any error from [`FillSource::close`]
    pub async fn close(&mut self) -> Result<(), InputError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.window.clear();
        self.source.close().await
    }

    /// The resident window, for diagnostics.
    pub fn window(&self) -> &BufferWindow {
        &self.window
    }

    pub(crate) fn source(&self) -> &F {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fill source over an in-memory byte vector that serves a fixed-size
    /// chunk per fill and counts fills.
    struct ChunkSource {
        bytes: Vec<u8>,
        chunk: usize,
        fills: usize,
    }

    impl ChunkSource {
        fn new(bytes: Vec<u8>, chunk: usize) -> Self {
            Self {
                bytes,
                chunk,
                fills: 0,
            }
        }
    }

    #[async_trait]
    impl FillSource for ChunkSource {
        fn len(&self) -> u64 {
            self.bytes.len() as u64
        }

        async fn fill(
            &mut self,
            position: u64,
            window: &mut BufferWindow,
        ) -> Result<(), InputError> {
            self.fills += 1;
            let start = position as usize;
            let end = (start + self.chunk).min(self.bytes.len());
            window.set(position, self.bytes[start..end].to_vec());
            Ok(())
        }

        async fn close(&mut self) -> Result<(), InputError> {
            Ok(())
        }
    }

    fn numbered(len: usize) -> Vec<u8> {
        (0..len).map(|i| i as u8).collect()
    }

    #[tokio::test]
    async fn test_read_advances_position() {
        let mut input = BufferedInput::new(ChunkSource::new(numbered(100), 32));
        let mut buf = [0u8; 10];

        let count = input.read(&mut buf).await.unwrap();
        assert_eq!(count, 10);
        assert_eq!(input.position(), 10);
        assert_eq!(&buf[..], &numbered(100)[..10]);
    }

    #[tokio::test]
    async fn test_seek_then_read_round_trip() {
        // position() == seek target + bytes read, for several targets.
        let bytes = numbered(200);
        let mut input = BufferedInput::new(ChunkSource::new(bytes.clone(), 64));

        for &target in &[0u64, 5, 63, 64, 150, 199] {
            input.seek(target).unwrap();
            let mut buf = [0u8; 16];
            let count = input.read(&mut buf).await.unwrap();
            assert!(count >= 1);
            assert_eq!(input.position(), target + count as u64);
            assert_eq!(&buf[..count], &bytes[target as usize..target as usize + count]);
        }
    }

    #[tokio::test]
    async fn test_buffer_hit_avoids_second_fill() {
        let mut input = BufferedInput::new(ChunkSource::new(numbered(100), 64));
        let mut buf = [0u8; 8];

        input.read(&mut buf).await.unwrap();
        input.read(&mut buf).await.unwrap();
        input.seek(3).unwrap();
        input.read(&mut buf).await.unwrap();

        assert_eq!(input.source().fills, 1);
    }

    #[tokio::test]
    async fn test_eof_returns_zero() {
        let mut input = BufferedInput::new(ChunkSource::new(numbered(10), 64));
        input.seek(10).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(input.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_clamps_at_window_boundary() {
        // A read spanning the resident window returns the resident part
        // only; the next read refills.
        let mut input = BufferedInput::new(ChunkSource::new(numbered(100), 32));
        let mut buf = [0u8; 10];
        input.read(&mut buf).await.unwrap(); // window now covers 0..32

        input.seek(30).unwrap();
        let count = input.read(&mut buf).await.unwrap();
        assert_eq!(count, 2);

        let count = input.read(&mut buf).await.unwrap();
        assert!(count >= 1);
        assert_eq!(input.source().fills, 2);
    }

    #[tokio::test]
    async fn test_seek_out_of_range() {
        let mut input = BufferedInput::new(ChunkSource::new(numbered(10), 4));

        assert!(input.seek(10).is_ok());
        let result = input.seek(11);
        assert!(matches!(
            result,
            Err(InputError::OutOfRange { offset: 11, len: 10 })
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_fails_reads() {
        let mut input = BufferedInput::new(ChunkSource::new(numbered(10), 4));

        input.close().await.unwrap();
        input.close().await.unwrap();

        let mut buf = [0u8; 4];
        assert!(matches!(
            input.read(&mut buf).await,
            Err(InputError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_empty_input() {
        let mut input = BufferedInput::new(ChunkSource::new(Vec::new(), 4));

        assert!(input.is_empty());
        let mut buf = [0u8; 4];
        assert_eq!(input.read(&mut buf).await.unwrap(), 0);
        assert!(input.seek(1).is_err());
    }
}

use std::io::{self, Write};

use bytes::Bytes;
use keeper_store::TempTarget;
use keeper_types::{Key, MetaOptions, ValueMeta};
use tracing::debug;

use crate::error::{KeeperError, KeeperResult};
use crate::keeper::Keeper;
use crate::text::is_utf8;

fn closed_stream() -> io::Error {
    io::Error::other(KeeperError::StreamClosed)
}

fn check_text_encoding(options: &MetaOptions) -> KeeperResult<()> {
    match options.encoding() {
        Some(encoding) if is_utf8(encoding) => Ok(()),
        Some(encoding) => Err(KeeperError::InvalidInput(format!(
            "cannot write text to a stream encoded as {encoding}"
        ))),
        None => Err(KeeperError::InvalidInput(
            "cannot write text to a binary stream".into(),
        )),
    }
}

/// Streaming write session backed by a storage temp target.
///
/// Bytes go straight to the temp target. [`WriteableStream::close`] reads
/// them back to derive the key, then either promotes the target or, when
/// the value already exists, discards it. A stream dropped without being
/// closed discards its target and never becomes visible.
pub struct WriteableStream<'k> {
    keeper: &'k Keeper,
    options: MetaOptions,
    target: Option<TempTarget>,
    length: u64,
    key: Option<Key>,
    closed: bool,
}

impl<'k> WriteableStream<'k> {
    pub(crate) fn new(keeper: &'k Keeper, options: MetaOptions, target: TempTarget) -> Self {
        Self {
            keeper,
            options,
            target: Some(target),
            length: 0,
            key: None,
            closed: false,
        }
    }

    /// Append UTF-8 text. Only valid on streams whose encoding is UTF-8.
    pub fn write_text(&mut self, text: &str) -> KeeperResult<()> {
        if self.closed {
            return Err(KeeperError::StreamClosed);
        }
        check_text_encoding(&self.options)?;
        self.write_all(text.as_bytes())?;
        Ok(())
    }

    /// Commit the stream and return its key.
    ///
    /// Closing again returns the same key.
    pub fn close(&mut self) -> KeeperResult<Key> {
        if self.closed {
            return self.key.ok_or(KeeperError::StreamClosed);
        }
        self.keeper.check_open()?;
        self.closed = true;
        let Some(target) = self.target.take() else {
            return Err(KeeperError::StreamClosed);
        };
        let handle = target.handle().clone();

        let committed = (|| -> KeeperResult<Key> {
            target.finish()?;
            let meta = ValueMeta::new(self.length, self.options.clone())?;
            let meta_bytes = meta.to_bytes()?;
            let key = self.keeper.digest_temp(&handle, self.length, &meta_bytes)?;
            self.keeper.commit_temp(&handle, &key, &meta_bytes)?;
            Ok(key)
        })();

        match committed {
            Ok(key) => {
                self.key = Some(key);
                Ok(key)
            }
            Err(e) => {
                if !handle.is_consumed() {
                    self.keeper.discard_quietly(&handle);
                }
                Err(e)
            }
        }
    }

    pub fn key(&self) -> Option<Key> {
        self.key
    }

    pub fn mime(&self) -> Option<&str> {
        self.options.mime()
    }

    pub fn encoding(&self) -> Option<&str> {
        self.options.encoding()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Write for WriteableStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let target = match (&mut self.target, self.closed) {
            (Some(target), false) => target,
            _ => return Err(closed_stream()),
        };
        let n = target.write(buf)?;
        self.length += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.target {
            Some(target) => target.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for WriteableStream<'_> {
    fn drop(&mut self) {
        if let Some(target) = self.target.take() {
            let handle = target.handle().clone();
            drop(target);
            debug!(handle = %handle, "discarding abandoned stream");
            self.keeper.discard_quietly(&handle);
        }
    }
}

impl std::fmt::Debug for WriteableStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteableStream")
            .field("length", &self.length)
            .field("key", &self.key)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Streaming write session that accumulates in memory.
///
/// On close the value is registered as pending, immediately readable through
/// the keeper, and persisted by the keeper's background flusher.
pub struct BufferedStream<'k> {
    keeper: &'k Keeper,
    options: MetaOptions,
    buf: Vec<u8>,
    key: Option<Key>,
    closed: bool,
}

impl<'k> BufferedStream<'k> {
    pub(crate) fn new(keeper: &'k Keeper, options: MetaOptions) -> Self {
        Self {
            keeper,
            options,
            buf: Vec::new(),
            key: None,
            closed: false,
        }
    }

    /// Append UTF-8 text. Only valid on streams whose encoding is UTF-8.
    pub fn write_text(&mut self, text: &str) -> KeeperResult<()> {
        if self.closed {
            return Err(KeeperError::StreamClosed);
        }
        check_text_encoding(&self.options)?;
        self.buf.extend_from_slice(text.as_bytes());
        Ok(())
    }

    /// Hand the value to the background flusher and return its key.
    ///
    /// Closing again returns the same key.
    pub fn close(&mut self) -> KeeperResult<Key> {
        if self.closed {
            return self.key.ok_or(KeeperError::StreamClosed);
        }
        self.keeper.check_open()?;
        self.closed = true;
        let data = Bytes::from(std::mem::take(&mut self.buf));
        let meta = ValueMeta::new(data.len() as u64, self.options.clone())?;
        let key = self.keeper.enqueue_pending(meta, data)?;
        self.key = Some(key);
        Ok(key)
    }

    pub fn key(&self) -> Option<Key> {
        self.key
    }

    pub fn mime(&self) -> Option<&str> {
        self.options.mime()
    }

    pub fn encoding(&self) -> Option<&str> {
        self.options.encoding()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Write for BufferedStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(closed_stream());
        }
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for BufferedStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedStream")
            .field("buffered", &self.buf.len())
            .field("key", &self.key)
            .field("closed", &self.closed)
            .finish()
    }
}

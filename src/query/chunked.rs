use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};

use super::backend::RowIter;
use crate::bridge::Bridge;
use crate::core::{ModelError, Result};

/// Cursor returned by `iterator()`
///
/// Each [`next_chunk`](ChunkedRows::next_chunk) pulls up to `chunk_size`
/// rows from the blocking iterator on a bridge worker.
pub struct ChunkedRows<T> {
    rows: Option<RowIter<T>>,
    chunk_size: usize,
    bridge: Bridge,
}

impl<T: Send + 'static> ChunkedRows<T> {
    pub(crate) fn new(rows: RowIter<T>, chunk_size: usize, bridge: Bridge) -> Self {
        Self {
            rows: Some(rows),
            chunk_size,
            bridge,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn is_exhausted(&self) -> bool {
        self.rows.is_none()
    }

    /// Next chunk of rows, or `None` once the cursor is exhausted.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<T>>> {
        let Some(mut rows) = self.rows.take() else {
            return Ok(None);
        };
        let chunk_size = self.chunk_size;

        let (rows, chunk) = self
            .bridge
            .call("iterator", move || {
                let mut chunk = Vec::with_capacity(chunk_size);
                for row in rows.by_ref().take(chunk_size) {
                    chunk.push(row?);
                }
                Ok::<_, ModelError>((rows, chunk))
            })
            .await?;

        if chunk.len() == chunk_size {
            self.rows = Some(rows);
        }
        if chunk.is_empty() {
            return Ok(None);
        }
        Ok(Some(chunk))
    }

    /// Drain every remaining chunk into one list.
    pub async fn collect_all(mut self) -> Result<Vec<T>> {
        let mut all = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            all.extend(chunk);
        }
        Ok(all)
    }

    /// Row-by-row stream over the remaining chunks.
    pub fn into_stream(self) -> BoxStream<'static, Result<T>> {
        stream::try_unfold(self, |mut cursor| async move {
            Ok::<_, ModelError>(cursor.next_chunk().await?.map(|chunk| (chunk, cursor)))
        })
        .map_ok(|chunk| stream::iter(chunk.into_iter().map(Ok::<T, ModelError>)))
        .try_flatten()
        .boxed()
    }
}

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, ready};
use pin_project_lite::pin_project;
use serde_json::Value;

use crate::error::{ErrorKind, MigrateResult};
use crate::migrate_error;

/// Returns `true` for the item that terminates a status stream.
pub fn is_end_marker(item: &Value) -> bool {
    matches!(
        item.get("status").and_then(Value::as_str),
        Some("DONE") | Some("ERROR")
    )
}

pin_project! {
    /// A stream of JSON items decoded from newline delimited text chunks.
    ///
    /// Chunks may split a line anywhere, blank lines are skipped. The stream ends after the item
    /// whose `status` is `DONE` or `ERROR`, after the first error, or when the chunks run out.
    #[must_use = "streams do nothing unless polled"]
    pub struct JsonLines<S> {
        #[pin]
        chunks: S,
        buffer: String,
        lines: VecDeque<String>,
        chunks_done: bool,
        finished: bool,
    }
}

impl<S> JsonLines<S> {
    pub fn wrap(chunks: S) -> Self {
        Self {
            chunks,
            buffer: String::new(),
            lines: VecDeque::new(),
            chunks_done: false,
            finished: false,
        }
    }
}

impl<S> Stream for JsonLines<S>
where
    S: Stream<Item = MigrateResult<String>>,
{
    type Item = MigrateResult<Value>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if *this.finished {
                return Poll::Ready(None);
            }

            if let Some(line) = this.lines.pop_front() {
                return match serde_json::from_str::<Value>(&line) {
                    Ok(item) => {
                        *this.finished = is_end_marker(&item);
                        Poll::Ready(Some(Ok(item)))
                    }
                    Err(err) => {
                        *this.finished = true;
                        Poll::Ready(Some(Err(migrate_error!(
                            ErrorKind::DeserializationError,
                            "Remote helper sent an invalid status line",
                            format!("{err}: {line}"),
                            source: err
                        ))))
                    }
                };
            }

            if *this.chunks_done {
                let rest = std::mem::take(this.buffer);
                if rest.trim().is_empty() {
                    *this.finished = true;
                } else {
                    this.lines.push_back(rest.trim().to_owned());
                }
                continue;
            }

            match ready!(this.chunks.as_mut().poll_next(cx)) {
                Some(Ok(chunk)) => {
                    this.buffer.push_str(&chunk);
                    while let Some(end) = this.buffer.find('\n') {
                        let line: String = this.buffer.drain(..=end).collect();
                        let line = line.trim();
                        if !line.is_empty() {
                            this.lines.push_back(line.to_owned());
                        }
                    }
                }
                Some(Err(err)) => {
                    *this.finished = true;
                    return Poll::Ready(Some(Err(err)));
                }
                None => *this.chunks_done = true,
            }
        }
    }
}

// Copyright (c) The testscout Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Incremental XML parsing for decoders built on XML report streams.
//!
//! [`XmlAdapter`] buffers raw chunks and replays complete events against an
//! [`XmlVisitor`] as soon as they can be parsed, without waiting for the
//! document to finish. A truncated document (the subprocess died mid-write)
//! still delivers every event that was complete, followed by
//! [`XmlVisitor::stream_closed`].

use quick_xml::{
    events::{BytesStart, Event},
    Reader,
};
use std::collections::BTreeMap;
use tracing::debug;

use crate::decode::Decoder;

/// Receiver of structural XML events, implemented per report format.
pub trait XmlVisitor {
    /// Whether the text content of `name` elements should be captured and
    /// delivered whole in [`XmlVisitor::element_finished`] rather than
    /// streamed through [`XmlVisitor::text`].
    fn capture_text(&self, name: &str) -> bool;

    /// An opening tag was parsed.
    fn element_started(&mut self, name: &str, attrs: &BTreeMap<String, String>);

    /// A closing tag was parsed. `text` is the captured content for elements
    /// selected by [`XmlVisitor::capture_text`], empty otherwise.
    fn element_finished(&mut self, name: &str, text: &str);

    /// Character data outside any captured element.
    fn text(&mut self, content: &str);

    /// The stream ended, complete or not.
    fn stream_closed(&mut self);
}

/// A [`Decoder`] front-end that turns raw output chunks into visitor calls.
pub struct XmlAdapter<V> {
    visitor: V,
    pending: Vec<u8>,
    // Open elements, innermost last, with captured text for each.
    stack: Vec<OpenElement>,
}

struct OpenElement {
    name: String,
    captured: Option<String>,
}

impl<V: XmlVisitor> XmlAdapter<V> {
    /// Wraps `visitor` in an adapter ready to receive chunks.
    pub fn new(visitor: V) -> Self {
        Self {
            visitor,
            pending: Vec::new(),
            stack: Vec::new(),
        }
    }

    /// Returns the wrapped visitor.
    pub fn visitor(&self) -> &V {
        &self.visitor
    }

    fn handle_start(&mut self, start: &BytesStart<'_>) {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut attrs = BTreeMap::new();
        for attr in start.attributes().flatten() {
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = match attr.unescape_value() {
                Ok(value) => value.into_owned(),
                Err(_) => String::from_utf8_lossy(&attr.value).into_owned(),
            };
            attrs.insert(key, value);
        }
        self.visitor.element_started(&name, &attrs);
        let captured = self.visitor.capture_text(&name).then(String::new);
        self.stack.push(OpenElement { name, captured });
    }

    fn handle_end(&mut self, name: &str) {
        // End names are not validated during parsing; unwind to the matching
        // open element so a stray close cannot desynchronize the stack.
        while let Some(open) = self.stack.pop() {
            let matches = open.name == name;
            self.visitor
                .element_finished(&open.name, open.captured.as_deref().unwrap_or(""));
            if matches {
                break;
            }
        }
    }

    fn handle_text(&mut self, content: &str) {
        match self.stack.last_mut() {
            Some(OpenElement {
                captured: Some(captured),
                ..
            }) => captured.push_str(content),
            _ => {
                // Whitespace between elements is formatting, not output.
                if !content.trim().is_empty() {
                    self.visitor.text(content);
                }
            }
        }
    }

    /// Parses as many complete events as the pending buffer allows.
    ///
    /// Any event that runs to the unterminated end of the buffer may be a
    /// split text run or a truncated tag that the parser surfaced as a
    /// (mangled) event rather than an error, so it is held back until more
    /// input arrives. At `at_eof`, trailing text is delivered as-is while a
    /// truncated tag is discarded.
    fn pump(&mut self, at_eof: bool) {
        let pending = std::mem::take(&mut self.pending);
        let mut reader = Reader::from_reader(&pending[..]);
        reader.expand_empty_elements(true);
        reader.check_end_names(false);

        let mut buf = Vec::new();
        let mut consumed = 0;
        loop {
            buf.clear();
            match reader.read_event_into(&mut buf) {
                Ok(Event::Eof) => break,
                Ok(event) => {
                    let end = reader.buffer_position();
                    if end >= pending.len() {
                        let is_text = matches!(event, Event::Text(_) | Event::CData(_));
                        if is_text {
                            if !at_eof {
                                break;
                            }
                        } else if pending.last() != Some(&b'>') {
                            // A tag whose closing `>` never arrived. The
                            // parser reports it as an event cut off at the
                            // end of input, not as an error.
                            if at_eof {
                                debug!("discarding truncated xml tag at end of stream");
                            }
                            break;
                        }
                    }
                    match event {
                        Event::Start(start) => self.handle_start(&start),
                        Event::End(end_tag) => {
                            let name =
                                String::from_utf8_lossy(end_tag.name().as_ref()).into_owned();
                            self.handle_end(&name);
                        }
                        Event::Text(text) => {
                            let content = match text.unescape() {
                                Ok(content) => content.into_owned(),
                                Err(_) => String::from_utf8_lossy(&text).into_owned(),
                            };
                            self.handle_text(&content);
                        }
                        Event::CData(data) => {
                            let content = String::from_utf8_lossy(&data).into_owned();
                            self.handle_text(&content);
                        }
                        // Declarations, comments, PIs and doctypes carry no
                        // report content.
                        _ => {}
                    }
                    consumed = end;
                }
                Err(error) => {
                    // Either a truncated construct awaiting more input, or
                    // junk. Both leave the remainder pending; close() reports
                    // what was parsed so far either way.
                    if at_eof {
                        debug!(%error, "discarding unparseable xml remainder");
                    }
                    break;
                }
            }
        }

        self.pending = pending[consumed..].to_vec();
    }
}

impl<V: XmlVisitor + Send> Decoder for XmlAdapter<V> {
    fn feed(&mut self, chunk: &str) {
        self.pending.extend_from_slice(chunk.as_bytes());
        self.pump(false);
    }

    fn close(&mut self) {
        self.pump(true);
        self.visitor.stream_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Clone, Debug, Eq, PartialEq)]
    enum Seen {
        Start(String, Vec<(String, String)>),
        End(String, String),
        Text(String),
        Closed,
    }

    #[derive(Default)]
    struct Recorder {
        seen: Vec<Seen>,
    }

    impl XmlVisitor for Recorder {
        fn capture_text(&self, name: &str) -> bool {
            name == "Captured"
        }

        fn element_started(&mut self, name: &str, attrs: &BTreeMap<String, String>) {
            let attrs = attrs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            self.seen.push(Seen::Start(name.to_owned(), attrs));
        }

        fn element_finished(&mut self, name: &str, text: &str) {
            self.seen.push(Seen::End(name.to_owned(), text.to_owned()));
        }

        fn text(&mut self, content: &str) {
            self.seen.push(Seen::Text(content.to_owned()));
        }

        fn stream_closed(&mut self) {
            self.seen.push(Seen::Closed);
        }
    }

    fn feed_all(chunks: &[&str]) -> Vec<Seen> {
        let mut adapter = XmlAdapter::new(Recorder::default());
        for chunk in chunks {
            adapter.feed(chunk);
        }
        adapter.close();
        adapter.visitor.seen
    }

    #[test]
    fn whole_document_in_one_chunk() {
        let seen = feed_all(&[r#"<Run a="1"><Captured>hi &amp; bye</Captured></Run>"#]);
        assert_eq!(
            seen,
            vec![
                Seen::Start("Run".to_owned(), vec![("a".to_owned(), "1".to_owned())]),
                Seen::Start("Captured".to_owned(), vec![]),
                Seen::End("Captured".to_owned(), "hi & bye".to_owned()),
                Seen::End("Run".to_owned(), String::new()),
                Seen::Closed,
            ]
        );
    }

    #[test]
    fn tags_split_across_chunks() {
        let seen = feed_all(&["<Run><Ca", "ptured>te", "xt</Captu", "red></Run>"]);
        assert_eq!(
            seen,
            vec![
                Seen::Start("Run".to_owned(), vec![]),
                Seen::Start("Captured".to_owned(), vec![]),
                Seen::End("Captured".to_owned(), "text".to_owned()),
                Seen::End("Run".to_owned(), String::new()),
                Seen::Closed,
            ]
        );
    }

    #[test]
    fn byte_at_a_time_chunks_deliver_identical_events() {
        let doc = r#"<Run a="1"><Captured>hi &amp; bye</Captured><Leaf x="y"/></Run>"#;
        let chunks: Vec<String> = doc.chars().map(|c| c.to_string()).collect();
        let refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
        assert_eq!(feed_all(&refs), feed_all(&[doc]));
    }

    #[test]
    fn self_closing_elements_are_expanded() {
        let seen = feed_all(&[r#"<Run><Leaf x="y"/></Run>"#]);
        assert_eq!(
            seen,
            vec![
                Seen::Start("Run".to_owned(), vec![]),
                Seen::Start("Leaf".to_owned(), vec![("x".to_owned(), "y".to_owned())]),
                Seen::End("Leaf".to_owned(), String::new()),
                Seen::End("Run".to_owned(), String::new()),
                Seen::Closed,
            ]
        );
    }

    #[test]
    fn uncaptured_text_is_streamed_and_whitespace_dropped() {
        let seen = feed_all(&["<Run>\n  stdout line\n  <Leaf/>\n</Run>"]);
        assert_eq!(
            seen,
            vec![
                Seen::Start("Run".to_owned(), vec![]),
                Seen::Text("\n  stdout line\n  ".to_owned()),
                Seen::Start("Leaf".to_owned(), vec![]),
                Seen::End("Leaf".to_owned(), String::new()),
                Seen::End("Run".to_owned(), String::new()),
                Seen::Closed,
            ]
        );
    }

    #[test]
    fn truncated_document_still_delivers_complete_events() {
        let seen = feed_all(&["<Run><Leaf></Leaf><Other"]);
        assert_eq!(
            seen,
            vec![
                Seen::Start("Run".to_owned(), vec![]),
                Seen::Start("Leaf".to_owned(), vec![]),
                Seen::End("Leaf".to_owned(), String::new()),
                Seen::Closed,
            ]
        );
    }

    #[test]
    fn stray_end_tag_unwinds_to_the_matching_element() {
        let seen = feed_all(&["<A><B></A>"]);
        assert_eq!(
            seen,
            vec![
                Seen::Start("A".to_owned(), vec![]),
                Seen::Start("B".to_owned(), vec![]),
                Seen::End("B".to_owned(), String::new()),
                Seen::End("A".to_owned(), String::new()),
                Seen::Closed,
            ]
        );
    }
}

//! Ordered decoder chain.

use spooltag_protocol::{ReadEvent, TagIds};
use tracing::debug;

/// Resolves a read event to a (spool, filament) pair.
///
/// Decoders never fail: anything they cannot resolve comes back as an
/// empty or partial [`TagIds`].
pub trait TagParser: Send + Sync {
    fn name(&self) -> &'static str;

    fn parse(&self, event: &ReadEvent) -> TagIds;
}

/// Tries decoders in order; the first one returning both ids wins.
#[derive(Default)]
pub struct ParserChain {
    parsers: Vec<Box<dyn TagParser>>,
}

impl ParserChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, parser: impl TagParser + 'static) -> Self {
        self.push(Box::new(parser));
        self
    }

    pub fn push(&mut self, parser: Box<dyn TagParser>) {
        self.parsers.push(parser);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.parsers.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.parsers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parsers.is_empty()
    }

    pub fn parse(&self, event: &ReadEvent) -> TagIds {
        for parser in &self.parsers {
            let ids = parser.parse(event);
            if ids.is_complete() {
                debug!(parser = parser.name(), identifier = %event.identifier, ?ids, "tag resolved");
                return ids;
            }
            if !ids.is_empty() {
                debug!(parser = parser.name(), ?ids, "partial result ignored");
            }
        }
        debug!(identifier = %event.identifier, "no parser resolved the tag");
        TagIds::empty()
    }
}

impl std::fmt::Debug for ParserChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParserChain").field("parsers", &self.names()).finish()
    }
}

use anyhow::{Context, Result};

use crate::message::Headers;

use super::{BodyFilter, FilterContext, HeaderFilter, MatchPredicate, RequestMeta, ResponseMeta};

/// A registered filter and the predicate deciding when it participates.
pub struct FilterEntry<F: ?Sized> {
    pub matcher: MatchPredicate,
    pub filter: Box<F>,
}

/// Ordered stack of filters for one hook point. Registration happens at
/// configuration time; the stack is immutable while serving. Per-message
/// state lives in the [`HeaderSelection`]/[`BodySession`] values returned by
/// `select`, which exist for exactly one message and are dropped at
/// end-of-data — re-selecting mid-message is unrepresentable.
pub struct FilterStack<F: ?Sized> {
    entries: Vec<FilterEntry<F>>,
}

pub type HeaderStack = FilterStack<dyn HeaderFilter>;
pub type BodyStack = FilterStack<dyn BodyFilter>;

impl<F: ?Sized> Default for FilterStack<F> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<F: ?Sized> FilterStack<F> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, matcher: MatchPredicate, filter: Box<F>) {
        self.entries.push(FilterEntry { matcher, filter });
    }

    pub fn insert(&mut self, index: usize, matcher: MatchPredicate, filter: Box<F>) {
        self.entries.insert(index, FilterEntry { matcher, filter });
    }

    pub fn remove(&mut self, index: usize) -> FilterEntry<F> {
        self.entries.remove(index)
    }

    pub fn all(&self) -> &[FilterEntry<F>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn selected_indices(
        &self,
        request: &RequestMeta,
        response: Option<&ResponseMeta>,
    ) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.matcher.matches(request, response))
            .map(|(index, _)| index)
            .collect()
    }
}

/// The header filters participating in one message.
pub struct HeaderSelection {
    indices: Vec<usize>,
}

impl HeaderSelection {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

impl HeaderStack {
    /// Evaluate predicates for one message and call `begin` on the selected
    /// filters, in registration order.
    pub fn select(
        &self,
        request: &RequestMeta,
        response: Option<&ResponseMeta>,
    ) -> HeaderSelection {
        let indices = self.selected_indices(request, response);
        for &index in &indices {
            self.entries[index].filter.begin(request, response);
        }
        HeaderSelection { indices }
    }

    /// Run the selected filters over the header bag, in order.
    pub fn run(
        &self,
        selection: &HeaderSelection,
        headers: &mut Headers,
        ctx: &mut FilterContext<'_>,
    ) -> Result<()> {
        for &index in &selection.indices {
            self.entries[index]
                .filter
                .filter(headers, ctx)
                .with_context(|| format!("header filter {index} failed"))?;
        }
        Ok(())
    }

    /// Call `end` on every selected filter, consuming the selection.
    pub fn finish(&self, selection: HeaderSelection) {
        for &index in &selection.indices {
            self.entries[index].filter.end();
        }
    }
}

/// The body filters participating in one message, with each filter's
/// carry-over buffer. Created at the first chunk, dropped at end-of-data.
pub struct BodySession {
    indices: Vec<usize>,
    carry: Vec<Vec<u8>>,
    will_modify: bool,
}

impl BodySession {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// True when any selected filter may change body length or content.
    pub fn will_modify(&self) -> bool {
        self.will_modify
    }

    #[cfg(test)]
    fn carry_bytes(&self) -> usize {
        self.carry.iter().map(Vec::len).sum()
    }
}

fn prepend(data: &mut Vec<u8>, mut held: Vec<u8>) {
    if held.is_empty() {
        return;
    }
    held.extend_from_slice(data);
    *data = held;
}

impl BodyStack {
    /// Evaluate predicates for one message, reset carry buffers, and call
    /// `begin` on the selected filters.
    pub fn select(&self, request: &RequestMeta, response: Option<&ResponseMeta>) -> BodySession {
        let indices = self.selected_indices(request, response);
        let mut will_modify = false;
        for &index in &indices {
            let filter = &self.entries[index].filter;
            filter.begin(request, response);
            will_modify |= filter.will_modify();
        }
        let carry = indices.iter().map(|_| Vec::new()).collect();
        BodySession {
            indices,
            carry,
            will_modify,
        }
    }

    /// Push one chunk through the selected filters. For the i-th filter, its
    /// carry buffer is prepended to the chunk and cleared before the call;
    /// the filter's output becomes the next filter's input.
    pub fn feed(
        &self,
        session: &mut BodySession,
        data: &mut Vec<u8>,
        request: &RequestMeta,
        response: Option<&ResponseMeta>,
    ) -> Result<()> {
        for (slot, &index) in session.indices.iter().enumerate() {
            prepend(data, std::mem::take(&mut session.carry[slot]));
            self.entries[index]
                .filter
                .filter(data, request, response, Some(&mut session.carry[slot]))
                .with_context(|| format!("body filter {index} failed"))?;
        }
        Ok(())
    }

    /// Final pass: each filter receives its remaining carry and no carry slot,
    /// so everything is flushed into `data`; `end` runs afterwards. The
    /// session is spent once this returns and must be dropped.
    pub fn finish(
        &self,
        session: &mut BodySession,
        data: &mut Vec<u8>,
        request: &RequestMeta,
        response: Option<&ResponseMeta>,
    ) -> Result<()> {
        for (slot, &index) in session.indices.iter().enumerate() {
            prepend(data, std::mem::take(&mut session.carry[slot]));
            self.entries[index]
                .filter
                .filter(data, request, response, None)
                .with_context(|| format!("body filter {index} failed on final flush"))?;
        }
        for &index in &session.indices {
            self.entries[index].filter.end();
        }
        Ok(())
    }
}

//! Daylog domain library: a command-driven personal time ledger.
//!
//! One line of terse command text creates, patches, or deletes dated activity
//! records ("tasks") for the current calendar day. The derived views, a tag
//! index and a Gantt-style column layout, are recomputed wholesale after every
//! mutation, so they can never go stale. Rendering is left to consumers; this
//! crate only hands out read-only views.

pub use crate::clock::{Clock, FixedClock, SystemClock};
pub use crate::command::{
    CommandLanguage, DefaultCommandParser, LineSpans, RefToken, Span, TagSpan,
};
pub use crate::core::{CommandError, EditOutcome, Tag, TagClass, TagIndex, Task, TaskRef, TaskStore};
pub use crate::engine::Engine;
pub use crate::storage::{JsonSnapshotStore, SnapshotStore};
pub use crate::tags::build_tag_index;
pub use crate::timeline::{TimelineBlock, TimelineLayout, layout};

pub mod core {
    use chrono::NaiveDateTime;
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::{collections::BTreeMap, fmt};

    /* ------------------------------- IDs ------------------------------- */

    /// Unique integer identifier of a task within its store.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct TaskRef(pub u32);

    impl fmt::Display for TaskRef {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    /* ------------------------------ Entities ------------------------------ */

    /// A single activity record. Both times set makes it "scheduled"; the
    /// timeline layout ignores everything else. `body` may embed tag tokens.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Task {
        pub id: TaskRef,
        pub begin: Option<NaiveDateTime>,
        pub end: Option<NaiveDateTime>,
        pub body: Option<String>,
    }

    impl Task {
        pub fn is_scheduled(&self) -> bool {
            self.begin.is_some() && self.end.is_some()
        }
    }

    /* ------------------------------ Aggregate ------------------------------ */

    /// Aggregate root: the tasks of one calendar day, keyed by ref.
    ///
    /// Invariant: every key equals its task's `id`. Iteration is ref-ascending,
    /// which doubles as the store's "original order" wherever a deterministic
    /// tie-break is needed.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct TaskStore {
        tasks: BTreeMap<TaskRef, Task>,
    }

    impl TaskStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn len(&self) -> usize {
            self.tasks.len()
        }

        pub fn is_empty(&self) -> bool {
            self.tasks.is_empty()
        }

        pub fn contains(&self, id: TaskRef) -> bool {
            self.tasks.contains_key(&id)
        }

        pub fn get(&self, id: TaskRef) -> Option<&Task> {
            self.tasks.get(&id)
        }

        pub fn get_mut(&mut self, id: TaskRef) -> Option<&mut Task> {
            self.tasks.get_mut(&id)
        }

        /// Insert under the task's own ref, keeping the key/id invariant.
        pub fn insert(&mut self, task: Task) {
            self.tasks.insert(task.id, task);
        }

        pub fn remove(&mut self, id: TaskRef) -> Option<Task> {
            self.tasks.remove(&id)
        }

        pub fn iter(&self) -> impl Iterator<Item = &Task> {
            self.tasks.values()
        }

        pub fn refs(&self) -> impl Iterator<Item = TaskRef> + '_ {
            self.tasks.keys().copied()
        }
    }

    /// Monotonic id allocation: one past the highest live ref, `0` when empty.
    /// Deleted ids are never reused.
    pub fn generate_id(store: &TaskStore) -> TaskRef {
        store
            .refs()
            .last()
            .map(|TaskRef(n)| TaskRef(n + 1))
            .unwrap_or(TaskRef(0))
    }

    /* ------------------------------- Tags ------------------------------- */

    /// Nesting depth of a tag namespace: the length of the marker run (`/`,
    /// `//`, ...) that introduced the tag token.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct TagClass(pub usize);

    /// Lowercased tag text.
    pub type Tag = String;

    /// Derived mapping from tag class to the unique tags of that class, both
    /// levels ordered by first occurrence across the store. Always rebuilt
    /// wholesale from the store; never patched in place.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct TagIndex {
        classes: IndexMap<TagClass, Vec<Tag>>,
    }

    impl TagIndex {
        pub fn len(&self) -> usize {
            self.classes.len()
        }

        pub fn is_empty(&self) -> bool {
            self.classes.is_empty()
        }

        pub fn get(&self, class: TagClass) -> &[Tag] {
            self.classes.get(&class).map(Vec::as_slice).unwrap_or(&[])
        }

        pub fn iter(&self) -> impl Iterator<Item = (TagClass, &[Tag])> {
            self.classes.iter().map(|(c, ts)| (*c, ts.as_slice()))
        }

        /// Append `tag` to `class` unless it is already listed there.
        pub fn insert_unique(&mut self, class: TagClass, tag: Tag) {
            let tags = self.classes.entry(class).or_default();
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
    }

    /* ------------------------------ Outcomes ------------------------------ */

    /// What a single applied command line did to the store.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum EditOutcome {
        Created(TaskRef),
        Updated(TaskRef),
        Deleted(TaskRef),
        Noop,
    }

    impl EditOutcome {
        pub fn is_mutation(&self) -> bool {
            !matches!(self, EditOutcome::Noop)
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum CommandError {
        /// A digit time token whose derived hour/minute falls outside a normal
        /// clock range. Reported explicitly instead of building a bogus
        /// timestamp; the store is left untouched.
        #[error("time token {token:?} does not name a valid clock time")]
        InvalidTime { token: String },
    }

}

pub mod clock {
    //! Resolution of relative time tokens against a clock.
    //!
    //! The clock itself sits behind a trait so tests (and any embedding
    //! application) can pin "now" to a fixed instant.

    use crate::core::CommandError;
    use chrono::{Local, NaiveDateTime, NaiveTime};

    pub trait Clock {
        fn now(&self) -> NaiveDateTime;
    }

    /// Wall clock in the local time zone.
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> NaiveDateTime {
            Local::now().naive_local()
        }
    }

    /// Test double pinned to one instant.
    pub struct FixedClock(pub NaiveDateTime);

    impl Clock for FixedClock {
        fn now(&self) -> NaiveDateTime {
            self.0
        }
    }

    /// Resolve a bare digit string to a timestamp on `now`'s calendar date.
    ///
    /// Two digits or fewer name a whole hour; otherwise the last two digits
    /// are the minute and the leading digits the hour ("930" → 09:30,
    /// "1045" → 10:45). Out-of-range components are an explicit error.
    pub fn resolve_digits(token: &str, now: NaiveDateTime) -> Result<NaiveDateTime, CommandError> {
        let invalid = || CommandError::InvalidTime {
            token: token.to_string(),
        };
        let (hour_digits, minute_digits) = if token.len() <= 2 {
            (token, "0")
        } else {
            token.split_at(token.len() - 2)
        };
        let hour: u32 = hour_digits.parse().map_err(|_| invalid())?;
        let minute: u32 = minute_digits.parse().map_err(|_| invalid())?;
        let time = NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(invalid)?;
        Ok(now.date().and_time(time))
    }

}

pub mod command {
    //! The command language: grammar, edit semantics, canonical encoding, tag
    //! scanning, and highlight spans.
    //!
    //! Grammar (order-sensitive, every part optional, no slack: a line with
    //! trailing unmatched text is rejected whole):
    //!
    //! ```text
    //! line := [ref ':'] [time] ['-' [time]] ['.' [body]]
    //! ref  := digits | '*'
    //! time := digits | 'n'
    //! body := remaining text
    //! ```
    //!
    //! The grammar lives behind the `CommandLanguage` trait so an alternate
    //! command language can be swapped in without touching the store, the tag
    //! index, or the layout engine.

    use crate::clock::{self, Clock};
    use crate::core::{
        CommandError, EditOutcome, Tag, TagClass, Task, TaskRef, TaskStore, generate_id,
    };
    use chrono::NaiveDateTime;
    use nom::{
        IResult,
        branch::alt,
        character::complete::{char, digit1},
        combinator::{map, map_res, opt, rest},
        error::VerboseError,
    };

    /* --------------------------- Trait (the seam) --------------------------- */

    pub trait CommandLanguage {
        /// Evaluate `line` against `store`. Lines that fail the grammar are a
        /// benign no-op; only invalid time tokens error, and then the store is
        /// guaranteed untouched.
        fn execute(
            &self,
            store: &mut TaskStore,
            clock: &dyn Clock,
            line: &str,
        ) -> Result<EditOutcome, CommandError>;

        /// Canonical command text that reproduces `task` exactly when executed
        /// against a store holding only that task at its ref.
        fn encode(&self, task: &Task) -> String;

        /// Scan a task body for tag tokens. Pure; touches no store.
        fn task_tags(&self, body: &str) -> Vec<(TagClass, Tag)>;

        /// Byte ranges of each grammar part and tag token within `line`, for
        /// live highlighting. Pure; `None` when the line fails the grammar.
        fn spans(&self, line: &str) -> Option<LineSpans>;

        /// The ref token of `line`, if the line parses and carries one. Used
        /// by input collaborators to preview a selection without executing.
        fn line_ref(&self, line: &str) -> Option<RefToken>;
    }

    /* ------------------------------ Span types ------------------------------ */

    /// Half-open byte range within a command line.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Span {
        pub start: usize,
        pub end: usize,
    }

    impl Span {
        pub fn slice<'a>(&self, line: &'a str) -> &'a str {
            &line[self.start..self.end]
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TagSpan {
        pub class: TagClass,
        pub span: Span,
    }

    /// Highlightable regions of one command line.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct LineSpans {
        pub task_ref: Option<Span>,
        pub begin: Option<Span>,
        pub end: Option<Span>,
        pub body: Option<Span>,
        pub tags: Vec<TagSpan>,
    }

    /* ------------------------------ Parse tree ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum RefToken {
        Id(TaskRef),
        /// `*`, a guard meaning "do nothing", never "all tasks".
        Wildcard,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum TimeToken {
        Now,
        Digits(String),
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    struct LineParts {
        ref_token: Option<(RefToken, Span)>,
        begin: Option<(TimeToken, Span)>,
        end: Option<(TimeToken, Span)>,
        body: Option<(String, Span)>,
    }

    /* ------------------------------- Parser ------------------------------- */

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    fn span_from(base_len: usize, before: &str, after: &str) -> Span {
        Span {
            start: base_len - before.len(),
            end: base_len - after.len(),
        }
    }

    /// Full-line match or nothing: any unconsumed trailing text rejects.
    fn parse_line(line: &str) -> Option<LineParts> {
        match line_parts(line) {
            Ok(("", parts)) => Some(parts),
            _ => None,
        }
    }

    fn line_parts(input: &str) -> PResult<'_, LineParts> {
        let base = input.len();
        let (i, ref_token) = opt(|i| ref_part(i, base))(input)?;
        let (i, begin) = opt(|i| time_part(i, base))(i)?;
        let (i, end) = map(opt(|i| dash_end_part(i, base)), Option::flatten)(i)?;
        let (i, body) = map(opt(|i| body_part(i, base)), Option::flatten)(i)?;
        Ok((
            i,
            LineParts {
                ref_token,
                begin,
                end,
                body,
            },
        ))
    }

    /// `digits ':'` or `'*' ':'`; the span covers the token, not the colon.
    fn ref_part(i: &str, base: usize) -> PResult<'_, (RefToken, Span)> {
        let before = i;
        let (i, token) = alt((
            map(char('*'), |_| RefToken::Wildcard),
            map_res(digit1, |d: &str| {
                d.parse::<u32>().map(|n| RefToken::Id(TaskRef(n)))
            }),
        ))(i)?;
        let span = span_from(base, before, i);
        let (i, _) = char(':')(i)?;
        Ok((i, (token, span)))
    }

    fn time_part(i: &str, base: usize) -> PResult<'_, (TimeToken, Span)> {
        let before = i;
        let (i, token) = alt((
            map(char('n'), |_| TimeToken::Now),
            map(digit1, |d: &str| TimeToken::Digits(d.to_string())),
        ))(i)?;
        Ok((i, (token, span_from(base, before, i))))
    }

    /// `'-' [time]`; a dash with no time is legal and leaves `end` unset.
    fn dash_end_part(i: &str, base: usize) -> PResult<'_, Option<(TimeToken, Span)>> {
        let (i, _) = char('-')(i)?;
        opt(|i| time_part(i, base))(i)
    }

    /// `'.' [body]`; a bare trailing dot is legal and leaves `body` unset.
    fn body_part(i: &str, base: usize) -> PResult<'_, Option<(String, Span)>> {
        let (i, _) = char('.')(i)?;
        let before = i;
        let (i, text) = rest(i)?;
        if text.is_empty() {
            Ok((i, None))
        } else {
            Ok((i, Some((text.to_string(), span_from(base, before, i)))))
        }
    }

    /* ----------------------------- Tag scanning ----------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TagToken {
        class: TagClass,
        text: Tag,
        start: usize,
        end: usize,
    }

    /// Tokens of the form "one-or-more `/` immediately followed by a
    /// non-whitespace run". The run length is the class; the text is
    /// lowercased. A marker run with nothing attached is not a tag.
    fn scan_tag_tokens(body: &str) -> Vec<TagToken> {
        let mut out = Vec::new();
        let mut it = body.char_indices().peekable();
        while let Some((start, c)) = it.next() {
            if c != '/' {
                continue;
            }
            let mut run = 1;
            while matches!(it.peek(), Some((_, '/'))) {
                it.next();
                run += 1;
            }
            let text_start = it.peek().map(|(j, _)| *j).unwrap_or(body.len());
            let mut text_end = text_start;
            while let Some((j, ch)) = it.peek().copied() {
                if ch.is_whitespace() {
                    break;
                }
                it.next();
                text_end = j + ch.len_utf8();
            }
            if text_end > text_start {
                out.push(TagToken {
                    class: TagClass(run),
                    text: body[text_start..text_end].to_lowercase(),
                    start,
                    end: text_end,
                });
            }
        }
        out
    }

    /* --------------------------- Default language --------------------------- */

    /// The one canonical grammar implementation.
    pub struct DefaultCommandParser;

    impl DefaultCommandParser {
        fn resolve(
            token: Option<(TimeToken, Span)>,
            now: NaiveDateTime,
        ) -> Result<Option<NaiveDateTime>, CommandError> {
            match token {
                None => Ok(None),
                Some((TimeToken::Now, _)) => Ok(Some(now)),
                Some((TimeToken::Digits(d), _)) => clock::resolve_digits(&d, now).map(Some),
            }
        }
    }

    impl CommandLanguage for DefaultCommandParser {
        fn execute(
            &self,
            store: &mut TaskStore,
            clock: &dyn Clock,
            line: &str,
        ) -> Result<EditOutcome, CommandError> {
            let Some(parts) = parse_line(line) else {
                return Ok(EditOutcome::Noop);
            };
            // Resolve everything up front: an invalid time must not leave a
            // partial mutation behind.
            let now = clock.now();
            let begin = Self::resolve(parts.begin, now)?;
            let end = Self::resolve(parts.end, now)?;
            let body = parts.body.map(|(text, _)| text);
            let ref_token = parts.ref_token.map(|(token, _)| token);
            let has_fields = begin.is_some() || end.is_some() || body.is_some();

            if !has_fields {
                // Delete form, or nothing at all.
                return Ok(match ref_token {
                    Some(RefToken::Id(id)) => match store.remove(id) {
                        Some(_) => EditOutcome::Deleted(id),
                        None => EditOutcome::Noop,
                    },
                    Some(RefToken::Wildcard) | None => EditOutcome::Noop,
                });
            }

            let numeric = match ref_token {
                Some(RefToken::Id(id)) => Some(id),
                _ => None,
            };
            match numeric.filter(|id| store.contains(*id)) {
                None => {
                    // Create. A brand-new task must carry text.
                    let Some(body) = body else {
                        return Ok(EditOutcome::Noop);
                    };
                    let id = numeric.unwrap_or_else(|| generate_id(store));
                    store.insert(Task {
                        id,
                        begin,
                        end,
                        body: Some(body),
                    });
                    Ok(EditOutcome::Created(id))
                }
                Some(id) => {
                    // Patch exactly the fields present on the line. The ref
                    // itself is immutable once created.
                    if let Some(task) = store.get_mut(id) {
                        if begin.is_some() {
                            task.begin = begin;
                        }
                        if end.is_some() {
                            task.end = end;
                        }
                        if body.is_some() {
                            task.body = body;
                        }
                    }
                    Ok(EditOutcome::Updated(id))
                }
            }
        }

        fn encode(&self, task: &Task) -> String {
            let mut text = format!("{}:", task.id);
            if let Some(begin) = task.begin {
                text.push_str(&begin.format("%H%M").to_string());
            }
            if let Some(end) = task.end {
                text.push('-');
                text.push_str(&end.format("%H%M").to_string());
            }
            if let Some(body) = &task.body {
                text.push('.');
                text.push_str(body);
            }
            text
        }

        fn task_tags(&self, body: &str) -> Vec<(TagClass, Tag)> {
            let mut out: Vec<(TagClass, Tag)> = Vec::new();
            for token in scan_tag_tokens(body) {
                let pair = (token.class, token.text);
                if !out.contains(&pair) {
                    out.push(pair);
                }
            }
            out
        }

        fn spans(&self, line: &str) -> Option<LineSpans> {
            let parts = parse_line(line)?;
            let tags = parts
                .body
                .as_ref()
                .map(|(text, span)| {
                    scan_tag_tokens(text)
                        .into_iter()
                        .map(|t| TagSpan {
                            class: t.class,
                            span: Span {
                                start: span.start + t.start,
                                end: span.start + t.end,
                            },
                        })
                        .collect()
                })
                .unwrap_or_default();
            Some(LineSpans {
                task_ref: parts.ref_token.map(|(_, s)| s),
                begin: parts.begin.map(|(_, s)| s),
                end: parts.end.map(|(_, s)| s),
                body: parts.body.map(|(_, s)| s),
                tags,
            })
        }

        fn line_ref(&self, line: &str) -> Option<RefToken> {
            parse_line(line)?.ref_token.map(|(token, _)| token)
        }
    }

}

pub mod tags {
    //! Derivation of the tag index from the store.
    //!
    //! Always a full recomputation: correct by construction, cheap at
    //! one-day data volumes (O(total body text) per rebuild).

    use crate::command::CommandLanguage;
    use crate::core::{TagIndex, TaskStore};

    /// Union every task's scanned tags into a fresh per-class index. Store
    /// iteration order fixes the first-seen insertion order, so an unchanged
    /// store always yields an identical index.
    pub fn build_tag_index(store: &TaskStore, language: &dyn CommandLanguage) -> TagIndex {
        let mut index = TagIndex::default();
        for task in store.iter() {
            let Some(body) = &task.body else { continue };
            for (class, tag) in language.task_tags(body) {
                index.insert_unique(class, tag);
            }
        }
        index
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::command::DefaultCommandParser;
        use crate::core::{TagClass, Task, TaskRef};

        fn task(id: u32, body: &str) -> Task {
            Task {
                id: TaskRef(id),
                begin: None,
                end: None,
                body: Some(body.to_string()),
            }
        }

        #[test]
        fn duplicate_tags_collapse_to_one_entry() {
            let mut store = TaskStore::new();
            store.insert(task(0, "Fix bug /urgent /urgent"));
            let index = build_tag_index(&store, &DefaultCommandParser);
            assert_eq!(index.get(TagClass(1)), ["urgent"]);
        }

        #[test]
        fn classes_group_by_marker_run_length() {
            let mut store = TaskStore::new();
            store.insert(task(0, "standup /work //team"));
            store.insert(task(1, "review /Work //infra /other"));
            let index = build_tag_index(&store, &DefaultCommandParser);
            assert_eq!(index.get(TagClass(1)), ["work", "other"]);
            assert_eq!(index.get(TagClass(2)), ["team", "infra"]);
        }

        #[test]
        fn rebuild_is_deterministic_including_order() {
            let mut store = TaskStore::new();
            store.insert(task(3, "/c /a"));
            store.insert(task(1, "/b /a //x"));
            let first = build_tag_index(&store, &DefaultCommandParser);
            let second = build_tag_index(&store, &DefaultCommandParser);
            assert_eq!(first, second);
            // Store order is ref-ascending, so task 1 seeds class 1.
            assert_eq!(first.get(TagClass(1)), ["b", "a", "c"]);
        }

        #[test]
        fn bodyless_tasks_contribute_nothing() {
            let mut store = TaskStore::new();
            store.insert(Task {
                id: TaskRef(0),
                begin: None,
                end: None,
                body: None,
            });
            assert!(build_tag_index(&store, &DefaultCommandParser).is_empty());
        }
    }
}

pub mod timeline {
    //! Greedy interval coloring for the day timeline.
    //!
    //! Scheduled tasks are assigned to non-overlapping display columns. Time
    //! intervals form an interval graph (a perfect graph), so first-fit
    //! coloring in left-endpoint order needs exactly as many columns as the
    //! true maximum number of simultaneously active tasks.

    use crate::core::{TaskRef, TaskStore};
    use chrono::NaiveDateTime;
    use serde::Serialize;

    /// One scheduled task's placement: a column index, the horizontal
    /// fraction `[x0, x1)` of a unit-width chart, and the vertical time span.
    #[derive(Debug, Clone, PartialEq, Serialize)]
    pub struct TimelineBlock {
        pub id: TaskRef,
        pub column: usize,
        pub x0: f64,
        pub x1: f64,
        pub begin: NaiveDateTime,
        pub end: NaiveDateTime,
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize)]
    pub struct TimelineLayout {
        /// Blocks in begin-ascending order.
        pub blocks: Vec<TimelineBlock>,
        /// True maximum number of simultaneously active tasks.
        pub max_concurrent: usize,
        /// Horizontal fraction occupied by one column.
        pub column_width: f64,
    }

    #[derive(Debug, Clone, Copy)]
    struct Interval {
        id: TaskRef,
        begin: NaiveDateTime,
        end: NaiveDateTime,
    }

    impl Interval {
        /// Inclusive at both bounds: boundary-touching counts as overlap.
        fn overlaps(&self, begin: NaiveDateTime, end: NaiveDateTime) -> bool {
            !(end < self.begin || begin > self.end)
        }
    }

    /// Column layout for every task with both times set. An empty input is an
    /// empty layout, not an error.
    pub fn layout(store: &TaskStore) -> TimelineLayout {
        let mut scheduled: Vec<Interval> = store
            .iter()
            .filter_map(|t| match (t.begin, t.end) {
                (Some(begin), Some(end)) => Some(Interval {
                    id: t.id,
                    begin,
                    end,
                }),
                _ => None,
            })
            .collect();
        if scheduled.is_empty() {
            return TimelineLayout::default();
        }

        let mut important_times: Vec<NaiveDateTime> = scheduled
            .iter()
            .flat_map(|iv| [iv.begin, iv.end])
            .collect();
        important_times.sort();
        important_times.dedup();
        let max_concurrent = important_times
            .iter()
            .map(|t| scheduled.iter().filter(|iv| iv.overlaps(*t, *t)).count())
            .max()
            .unwrap_or(1);
        let column_width = 1.0 / max_concurrent as f64;

        // Left-endpoint order; the sort is stable, so store order breaks ties.
        scheduled.sort_by_key(|iv| iv.begin);

        let mut blocks: Vec<TimelineBlock> = Vec::with_capacity(scheduled.len());
        for iv in &scheduled {
            let mut used = vec![false; max_concurrent];
            for placed in &blocks {
                if placed.column < max_concurrent && iv.overlaps(placed.begin, placed.end) {
                    used[placed.column] = true;
                }
            }
            let column = used.iter().position(|u| !*u).unwrap_or(used.len());
            blocks.push(TimelineBlock {
                id: iv.id,
                column,
                x0: column as f64 * column_width,
                x1: (column + 1) as f64 * column_width,
                begin: iv.begin,
                end: iv.end,
            });
        }

        TimelineLayout {
            blocks,
            max_concurrent,
            column_width,
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::Task;
        use chrono::NaiveDate;

        fn at(h: u32, m: u32) -> NaiveDateTime {
            NaiveDate::from_ymd_opt(2021, 3, 4)
                .expect("date")
                .and_hms_opt(h, m, 0)
                .expect("time")
        }

        fn store_of(spans: &[(u32, (u32, u32), (u32, u32))]) -> TaskStore {
            let mut store = TaskStore::new();
            for (id, b, e) in spans {
                store.insert(Task {
                    id: TaskRef(*id),
                    begin: Some(at(b.0, b.1)),
                    end: Some(at(e.0, e.1)),
                    body: Some(format!("task {id}")),
                });
            }
            store
        }

        fn assert_valid(layout: &TimelineLayout) {
            for a in &layout.blocks {
                assert!(a.column < layout.max_concurrent);
                for b in &layout.blocks {
                    if a.id != b.id && !(b.end < a.begin || b.begin > a.end) {
                        assert_ne!(a.column, b.column, "{:?} vs {:?}", a.id, b.id);
                    }
                }
            }
        }

        #[test]
        fn empty_store_yields_empty_layout() {
            assert_eq!(layout(&TaskStore::new()), TimelineLayout::default());
        }

        #[test]
        fn unscheduled_tasks_are_excluded() {
            let mut store = TaskStore::new();
            store.insert(Task {
                id: TaskRef(0),
                begin: Some(at(9, 0)),
                end: None,
                body: Some("half scheduled".into()),
            });
            assert!(layout(&store).blocks.is_empty());
        }

        #[test]
        fn chained_overlaps_reuse_freed_columns() {
            // [9:00,10:00], [9:30,10:30], [10:15,11:00]: max two at once; the
            // third overlaps only the second and must avoid its column.
            let store = store_of(&[
                (0, (9, 0), (10, 0)),
                (1, (9, 30), (10, 30)),
                (2, (10, 15), (11, 0)),
            ]);
            let out = layout(&store);
            assert_eq!(out.max_concurrent, 2);
            assert_eq!(out.column_width, 0.5);
            let col = |id: u32| {
                out.blocks
                    .iter()
                    .find(|b| b.id == TaskRef(id))
                    .expect("block")
                    .column
            };
            assert_eq!(col(0), 0);
            assert_eq!(col(1), 1);
            assert_ne!(col(2), col(1));
            assert_valid(&out);
        }

        #[test]
        fn boundary_touching_counts_as_overlap() {
            let store = store_of(&[(0, (9, 0), (10, 0)), (1, (10, 0), (11, 0))]);
            let out = layout(&store);
            assert_eq!(out.max_concurrent, 2);
            assert_ne!(out.blocks[0].column, out.blocks[1].column);
            assert_valid(&out);
        }

        #[test]
        fn disjoint_tasks_share_the_single_column() {
            let store = store_of(&[(0, (9, 0), (9, 30)), (1, (10, 0), (10, 30))]);
            let out = layout(&store);
            assert_eq!(out.max_concurrent, 1);
            assert!(out.blocks.iter().all(|b| b.column == 0));
            assert_eq!(out.blocks[0].x0, 0.0);
            assert_eq!(out.blocks[0].x1, 1.0);
        }

        #[test]
        fn columns_never_exceed_true_concurrency() {
            // A pile of staggered meetings; three run at 10:00 but never four.
            let store = store_of(&[
                (0, (9, 0), (10, 30)),
                (1, (9, 45), (11, 0)),
                (2, (10, 0), (10, 15)),
                (3, (10, 30), (12, 0)),
                (4, (11, 30), (13, 0)),
                (5, (13, 30), (14, 0)),
            ]);
            let out = layout(&store);
            assert_eq!(out.max_concurrent, 3);
            assert_valid(&out);
        }

        #[test]
        fn blocks_come_out_in_begin_order() {
            let store = store_of(&[(5, (11, 0), (12, 0)), (9, (9, 0), (10, 0))]);
            let out = layout(&store);
            let ids: Vec<TaskRef> = out.blocks.iter().map(|b| b.id).collect();
            assert_eq!(ids, vec![TaskRef(9), TaskRef(5)]);
        }
    }
}

pub mod storage {
    //! Per-day snapshot persistence.
    //!
    //! One JSON file per calendar day, path derived deterministically from the
    //! date. The gateway sits behind a trait so an embedding application can
    //! substitute its own medium without touching the engine.

    use crate::core::TaskStore;
    use anyhow::{Context, Result};
    use chrono::NaiveDate;
    use std::{
        fs,
        path::{Path, PathBuf},
    };

    pub trait SnapshotStore {
        /// Read the snapshot for `date` if present, else an empty store.
        fn load(&self, date: NaiveDate) -> Result<TaskStore>;

        /// Serialize the full store (never a diff) to the snapshot for
        /// `date`, creating the containing directory if absent. I/O failures
        /// propagate; the in-memory store is the caller's and stays intact.
        fn save(&self, store: &TaskStore, date: NaiveDate) -> Result<()>;
    }

    /// Concrete gateway writing `<base_dir>/<YY-MM-DD>.json`.
    pub struct JsonSnapshotStore {
        base_dir: PathBuf,
    }

    impl JsonSnapshotStore {
        pub fn new(base_dir: impl Into<PathBuf>) -> Self {
            Self {
                base_dir: base_dir.into(),
            }
        }

        pub fn base_dir(&self) -> &Path {
            &self.base_dir
        }

        pub fn snapshot_path(&self, date: NaiveDate) -> PathBuf {
            self.base_dir
                .join(format!("{}.json", date.format("%y-%m-%d")))
        }
    }

    impl SnapshotStore for JsonSnapshotStore {
        fn load(&self, date: NaiveDate) -> Result<TaskStore> {
            let path = self.snapshot_path(date);
            if !path.exists() {
                return Ok(TaskStore::new());
            }
            let text =
                fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
            serde_json::from_str(&text).with_context(|| format!("decoding {:?}", path))
        }

        fn save(&self, store: &TaskStore, date: NaiveDate) -> Result<()> {
            fs::create_dir_all(&self.base_dir)
                .with_context(|| format!("creating {:?}", self.base_dir))?;
            let path = self.snapshot_path(date);
            let text = serde_json::to_string_pretty(store).context("encoding task store")?;
            fs::write(&path, text.as_bytes()).with_context(|| format!("writing {:?}", path))
        }
    }

}

pub mod engine {
    //! The engine: sole owner of the store, the derived tag index, and the
    //! selection cursor. Every mutation funnels through `apply`, which
    //! enforces the post-mutation ritual (re-derive tags, persist the day,
    //! drop the selection) in one place. No globals, no scattered writes.

    use crate::clock::Clock;
    use crate::command::{CommandLanguage, LineSpans, RefToken};
    use crate::core::{EditOutcome, Tag, TagClass, TagIndex, Task, TaskRef, TaskStore};
    use crate::storage::SnapshotStore;
    use crate::tags::build_tag_index;
    use crate::timeline::{self, TimelineLayout};
    use anyhow::Result;
    use chrono::NaiveDate;

    pub struct Engine {
        language: Box<dyn CommandLanguage>,
        clock: Box<dyn Clock>,
        snapshots: Box<dyn SnapshotStore>,
        today: NaiveDate,
        store: TaskStore,
        tags: TagIndex,
        selected: Option<usize>,
    }

    impl Engine {
        /// Resolve today from the clock and load its snapshot. No other date
        /// is ever auto-loaded.
        pub fn open(
            language: Box<dyn CommandLanguage>,
            clock: Box<dyn Clock>,
            snapshots: Box<dyn SnapshotStore>,
        ) -> Result<Self> {
            let today = clock.now().date();
            let store = snapshots.load(today)?;
            let tags = build_tag_index(&store, language.as_ref());
            Ok(Self {
                language,
                clock,
                snapshots,
                today,
                store,
                tags,
                selected: None,
            })
        }

        /// Apply one command line. On an accepted mutation the tag index is
        /// rebuilt wholesale and the day is persisted synchronously; either
        /// way the selection is dropped. Parse rejects are `Ok(Noop)`; time
        /// and persistence failures propagate with the store intact.
        pub fn apply(&mut self, line: &str) -> Result<EditOutcome> {
            let outcome = self
                .language
                .execute(&mut self.store, self.clock.as_ref(), line)?;
            if outcome.is_mutation() {
                self.tags = build_tag_index(&self.store, self.language.as_ref());
                self.snapshots.save(&self.store, self.today)?;
            }
            self.selected = None;
            Ok(outcome)
        }

        /* ---------------------------- Read views ---------------------------- */

        pub fn today(&self) -> NaiveDate {
            self.today
        }

        pub fn store(&self) -> &TaskStore {
            &self.store
        }

        pub fn tag_index(&self) -> &TagIndex {
            &self.tags
        }

        /// Tasks for tabular display: by begin ascending, unscheduled-begin
        /// tasks first, ref as the tie-break.
        pub fn ordered_tasks(&self) -> Vec<&Task> {
            let mut tasks: Vec<&Task> = self.store.iter().collect();
            tasks.sort_by_key(|t| (t.begin.is_some(), t.begin, t.id));
            tasks
        }

        pub fn timeline(&self) -> TimelineLayout {
            timeline::layout(&self.store)
        }

        pub fn encode(&self, task: &Task) -> String {
            self.language.encode(task)
        }

        pub fn spans(&self, line: &str) -> Option<LineSpans> {
            self.language.spans(line)
        }

        /// A task's resolved tags in one caller-selected class, for mapping
        /// tags to colors against the index of the same class.
        pub fn task_tags_in_class(&self, id: TaskRef, class: TagClass) -> Vec<Tag> {
            let Some(body) = self.store.get(id).and_then(|t| t.body.as_deref()) else {
                return Vec::new();
            };
            self.language
                .task_tags(body)
                .into_iter()
                .filter(|(c, _)| *c == class)
                .map(|(_, tag)| tag)
                .collect()
        }

        /* ---------------------------- Selection ---------------------------- */

        pub fn selected_index(&self) -> Option<usize> {
            self.selected
        }

        pub fn selected(&self) -> Option<&Task> {
            self.selected
                .and_then(|i| self.ordered_tasks().get(i).copied())
        }

        /// Cursor down: from "no selection" to the first task; past the last
        /// task back to "no selection".
        pub fn select_next(&mut self) {
            let len = self.store.len();
            if len == 0 {
                self.selected = None;
                return;
            }
            self.selected = match self.selected {
                None => Some(0),
                Some(i) if i + 1 >= len => None,
                Some(i) => Some(i + 1),
            };
        }

        /// Cursor up: the mirror image of `select_next`.
        pub fn select_previous(&mut self) {
            let len = self.store.len();
            if len == 0 {
                self.selected = None;
                return;
            }
            self.selected = match self.selected {
                None => Some(len - 1),
                Some(0) => None,
                Some(i) => Some(i - 1),
            };
        }

        pub fn select_by_ref(&mut self, id: TaskRef) {
            self.selected = self
                .ordered_tasks()
                .iter()
                .position(|t| t.id == id)
                .or(self.selected);
        }

        pub fn deselect(&mut self) {
            self.selected = None;
        }

        /// Selection preview while a line is being typed: a numeric ref on
        /// the line selects that task, anything else clears the selection.
        pub fn preview_selection(&mut self, line: &str) {
            match self.language.line_ref(line) {
                Some(RefToken::Id(id)) if self.store.contains(id) => {
                    self.selected = self.ordered_tasks().iter().position(|t| t.id == id);
                }
                _ => self.selected = None,
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::clock::FixedClock;
        use crate::command::DefaultCommandParser;
        use crate::storage::JsonSnapshotStore;
        use chrono::{NaiveDate, NaiveDateTime};

        fn now() -> NaiveDateTime {
            NaiveDate::from_ymd_opt(2021, 3, 4)
                .expect("date")
                .and_hms_opt(13, 0, 0)
                .expect("time")
        }

        fn engine_in(dir: &std::path::Path) -> Engine {
            Engine::open(
                Box::new(DefaultCommandParser),
                Box::new(FixedClock(now())),
                Box::new(JsonSnapshotStore::new(dir)),
            )
            .expect("open engine")
        }

        #[test]
        fn apply_rederives_tags_and_persists() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let mut engine = engine_in(tmp.path());

            engine.apply("930-1045.Write report /work").expect("apply");
            assert_eq!(engine.tag_index().get(TagClass(1)), ["work"]);

            // A fresh engine over the same directory sees the saved day.
            let reopened = engine_in(tmp.path());
            assert_eq!(reopened.store(), engine.store());
            assert_eq!(reopened.tag_index(), engine.tag_index());
        }

        #[test]
        fn tag_index_shrinks_when_the_last_reference_goes() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let mut engine = engine_in(tmp.path());
            engine.apply(".alpha /a").expect("apply");
            engine.apply(".beta /a /b").expect("apply");
            engine.apply("1:").expect("apply");
            assert_eq!(engine.tag_index().get(TagClass(1)), ["a"]);
        }

        #[test]
        fn noop_lines_do_not_rewrite_the_snapshot() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let mut engine = engine_in(tmp.path());
            let outcome = engine.apply("not a command").expect("apply");
            assert_eq!(outcome, EditOutcome::Noop);
            let gateway = JsonSnapshotStore::new(tmp.path());
            assert!(!gateway.snapshot_path(now().date()).exists());
        }

        #[test]
        fn ordered_tasks_put_unscheduled_first() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let mut engine = engine_in(tmp.path());
            engine.apply("11-12.late").expect("apply");
            engine.apply(".floating").expect("apply");
            engine.apply("9-10.early").expect("apply");
            let bodies: Vec<&str> = engine
                .ordered_tasks()
                .iter()
                .filter_map(|t| t.body.as_deref())
                .collect();
            assert_eq!(bodies, vec!["floating", "early", "late"]);
        }

        #[test]
        fn selection_wraps_through_none_at_both_ends() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let mut engine = engine_in(tmp.path());
            engine.apply(".one").expect("apply");
            engine.apply(".two").expect("apply");

            assert_eq!(engine.selected_index(), None);
            engine.select_next();
            assert_eq!(engine.selected_index(), Some(0));
            engine.select_next();
            assert_eq!(engine.selected_index(), Some(1));
            engine.select_next();
            assert_eq!(engine.selected_index(), None);

            engine.select_previous();
            assert_eq!(engine.selected_index(), Some(1));
            engine.select_previous();
            engine.select_previous();
            assert_eq!(engine.selected_index(), None);
        }

        #[test]
        fn apply_drops_the_selection() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let mut engine = engine_in(tmp.path());
            engine.apply(".one").expect("apply");
            engine.select_next();
            assert!(engine.selected().is_some());
            engine.apply(".two").expect("apply");
            assert_eq!(engine.selected_index(), None);
        }

        #[test]
        fn select_by_ref_finds_the_display_position() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let mut engine = engine_in(tmp.path());
            engine.apply("11-12.late").expect("apply");
            engine.apply("9-10.early").expect("apply");
            engine.select_by_ref(TaskRef(0));
            // Task 0 begins later, so it sits second in display order.
            assert_eq!(engine.selected_index(), Some(1));
            assert_eq!(engine.selected().map(|t| t.id), Some(TaskRef(0)));
        }

        #[test]
        fn preview_selection_follows_the_typed_ref() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let mut engine = engine_in(tmp.path());
            engine.apply(".one").expect("apply");
            engine.preview_selection("0:1200");
            assert_eq!(engine.selected().map(|t| t.id), Some(TaskRef(0)));
            engine.preview_selection("*:");
            assert_eq!(engine.selected_index(), None);
        }

        #[test]
        fn task_tags_in_class_filters_by_class() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let mut engine = engine_in(tmp.path());
            engine
                .apply(".deep work /focus //project /focus")
                .expect("apply");
            assert_eq!(
                engine.task_tags_in_class(TaskRef(0), TagClass(1)),
                vec!["focus".to_string()]
            );
            assert_eq!(
                engine.task_tags_in_class(TaskRef(0), TagClass(2)),
                vec!["project".to_string()]
            );
            assert!(
                engine
                    .task_tags_in_class(TaskRef(9), TagClass(1))
                    .is_empty()
            );
        }

        #[test]
        fn scenario_sequence_end_to_end() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let mut engine = engine_in(tmp.path());

            assert_eq!(
                engine.apply("930-1045.Write report").expect("apply"),
                EditOutcome::Created(TaskRef(0))
            );
            assert_eq!(
                engine.apply("0:1200").expect("apply"),
                EditOutcome::Updated(TaskRef(0))
            );
            let begin = engine.store().get(TaskRef(0)).and_then(|t| t.begin);
            assert_eq!(
                begin,
                NaiveDate::from_ymd_opt(2021, 3, 4)
                    .expect("date")
                    .and_hms_opt(12, 0, 0)
            );
            assert_eq!(
                engine.apply("0:").expect("apply"),
                EditOutcome::Deleted(TaskRef(0))
            );
            assert!(engine.store().is_empty());
        }
    }
}

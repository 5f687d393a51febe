use std::cmp::Ordering;
use std::fs;
use std::time::SystemTime;

use crate::config::SearchOptions;
use crate::context::SearchContext;
use crate::errors::SearchResult;
use crate::ops::{format_size, ColumnWidths, MatchConsumer};
use crate::results::{DirectorySizeMap, SearchItem, SortDescriptor, SortField};

/// Optional buffering, sorting and capping between the walker and the
/// operation executor. Streaming unless sorting or property columns
/// require the buffer.
pub struct ResultPipeline {
    buffer: Option<Vec<SearchItem>>,
    sort: Vec<SortDescriptor>,
    max_count: usize,
    emitted: usize,
}

impl ResultPipeline {
    pub fn new(options: &SearchOptions) -> Self {
        Self {
            buffer: options.buffered().then(Vec::new),
            sort: options.sort.clone(),
            max_count: options.max_count,
            emitted: 0,
        }
    }

    pub fn push(
        &mut self,
        item: SearchItem,
        consumer: &mut dyn MatchConsumer,
        context: &SearchContext,
    ) -> SearchResult<()> {
        if let Some(buffer) = &mut self.buffer {
            buffer.push(item);
            return Ok(());
        }
        if self.max_count > 0 && self.emitted >= self.max_count {
            return Ok(());
        }
        self.emitted += 1;
        consumer.consume(&item, context)
    }

    /// True once a streaming pipeline has emitted `max_count` results;
    /// the command loop may stop pulling matches.
    pub fn is_full(&self) -> bool {
        self.buffer.is_none() && self.max_count > 0 && self.emitted >= self.max_count
    }

    /// Sorts, caps and emits the buffer (a no-op when streaming).
    pub fn finish(
        &mut self,
        consumer: &mut dyn MatchConsumer,
        context: &SearchContext,
        sizes: &mut DirectorySizeMap,
    ) -> SearchResult<()> {
        let Some(mut buffer) = self.buffer.take() else {
            return Ok(());
        };
        sort_items(&mut buffer, &self.sort, sizes);
        if self.max_count > 0 {
            buffer.truncate(self.max_count);
        }

        let mut widths = ColumnWidths::default();
        for item in &buffer {
            widths.path = widths.path.max(item.relative_path().display().to_string().len());
            widths.size = widths.size.max(format_size(item.size(sizes)).len());
        }
        consumer.set_widths(widths);

        for item in &buffer {
            consumer.consume(item, context)?;
        }
        Ok(())
    }
}

struct SortKeys {
    name: String,
    created: SystemTime,
    modified: SystemTime,
    size: u64,
    matched: String,
    length: usize,
}

fn keys_for(item: &SearchItem, fields: &[SortField], sizes: &mut DirectorySizeMap) -> SortKeys {
    let metadata = fields
        .iter()
        .any(|f| matches!(f, SortField::CreationTime | SortField::ModifiedTime))
        .then(|| fs::metadata(item.path()).ok())
        .flatten();
    SortKeys {
        name: item.relative_path().display().to_string(),
        created: metadata
            .as_ref()
            .and_then(|m| m.created().ok())
            .unwrap_or(SystemTime::UNIX_EPOCH),
        modified: metadata
            .as_ref()
            .and_then(|m| m.modified().ok())
            .unwrap_or(SystemTime::UNIX_EPOCH),
        size: fields
            .contains(&SortField::Size)
            .then(|| item.size(sizes))
            .unwrap_or(0),
        matched: item
            .file_match
            .content_match
            .as_ref()
            .or(item.file_match.name_match.as_ref())
            .map(|m| m.value.clone())
            .unwrap_or_default(),
        length: item.path().as_os_str().len(),
    }
}

fn sort_items(items: &mut [SearchItem], descriptors: &[SortDescriptor], sizes: &mut DirectorySizeMap) {
    if descriptors.is_empty() {
        return;
    }
    let fields: Vec<SortField> = descriptors.iter().map(|d| d.field).collect();
    let mut decorated: Vec<(SortKeys, SearchItem)> = items
        .iter()
        .map(|item| (keys_for(item, &fields, sizes), item.clone()))
        .collect();

    decorated.sort_by(|(a, _), (b, _)| {
        for descriptor in descriptors {
            let ordering = match descriptor.field {
                SortField::Name => a.name.cmp(&b.name),
                SortField::CreationTime => a.created.cmp(&b.created),
                SortField::ModifiedTime => a.modified.cmp(&b.modified),
                SortField::Size => a.size.cmp(&b.size),
                SortField::Match => a.matched.cmp(&b.matched),
                SortField::Length => a.length.cmp(&b.length),
            };
            let ordering = if descriptor.descending {
                ordering.reverse()
            } else {
                ordering
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });

    for (slot, (_, item)) in items.iter_mut().zip(decorated) {
        *slot = item;
    }
}

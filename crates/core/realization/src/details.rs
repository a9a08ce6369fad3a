//! Segment details: the persisted layout instances of one segment.

use std::{collections::BTreeSet, sync::Arc};

use metadata_store::{CachedCrud, Entity, Envelope, ResourceStore, SharedEntityError};

use crate::{
    error::Result,
    ids::{LayoutId, ModelId, PartitionId, SegmentId},
    layout::Layout,
};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SegmentDetails {
    segment_id: SegmentId,
    model_id: ModelId,
    /// Sorted by layout id, at most one entry per id.
    #[serde(default)]
    layouts: Vec<Layout>,
    #[serde(skip)]
    envelope: Envelope,
}

impl SegmentDetails {
    pub fn new(model_id: ModelId, segment_id: SegmentId) -> Self {
        Self {
            segment_id,
            model_id,
            layouts: Vec::new(),
            envelope: Envelope::default(),
        }
    }

    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    pub fn model_id(&self) -> ModelId {
        self.model_id
    }

    pub fn layouts(&self) -> &[Layout] {
        &self.layouts
    }

    pub fn layout(&self, id: LayoutId) -> Option<&Layout> {
        self.layouts
            .binary_search_by_key(&id, |l| l.layout_id)
            .ok()
            .map(|idx| &self.layouts[idx])
    }

    pub fn total_rows(&self) -> i64 {
        self.layouts
            .iter()
            .filter(|l| l.is_effective())
            .map(|l| l.rows)
            .sum()
    }

    /// Adds layouts, replacing any existing layout with the same id. Returns `true` on change.
    pub fn upsert_layouts<'a>(
        &mut self,
        layouts: impl IntoIterator<Item = &'a Layout>,
    ) -> Result<bool, SharedEntityError> {
        self.check_writable()?;
        let mut changed = false;
        for layout in layouts {
            match self
                .layouts
                .binary_search_by_key(&layout.layout_id, |l| l.layout_id)
            {
                Ok(idx) if self.layouts[idx] == *layout => {}
                Ok(idx) => {
                    self.layouts[idx] = layout.clone();
                    changed = true;
                }
                Err(idx) => {
                    self.layouts.insert(idx, layout.clone());
                    changed = true;
                }
            }
        }
        Ok(changed)
    }

    /// Drops layouts by id. Returns `true` on change.
    pub fn remove_layouts(&mut self, ids: &BTreeSet<LayoutId>) -> Result<bool, SharedEntityError> {
        self.check_writable()?;
        let before = self.layouts.len();
        self.layouts.retain(|l| !ids.contains(&l.layout_id));
        Ok(self.layouts.len() != before)
    }

    /// Drops partitions from the layouts selected by `layouts` (all layouts if `None`).
    /// Returns `true` on change.
    pub fn remove_partitions(
        &mut self,
        layouts: Option<&BTreeSet<LayoutId>>,
        partitions: &BTreeSet<PartitionId>,
    ) -> Result<bool, SharedEntityError> {
        self.check_writable()?;
        let mut changed = false;
        for layout in &mut self.layouts {
            if layouts.is_some_and(|ids| !ids.contains(&layout.layout_id)) {
                continue;
            }
            let before = layout.multi_partitions.len();
            layout
                .multi_partitions
                .retain(|p| !partitions.contains(&p.partition_id));
            if layout.multi_partitions.len() != before {
                layout.rows = layout.multi_partitions.iter().map(|p| p.rows).sum();
                layout.byte_size = layout.multi_partitions.iter().map(|p| p.byte_size).sum();
                changed = true;
            }
        }
        Ok(changed)
    }
}

impl Entity for SegmentDetails {
    const RESOURCE_TYPE: &'static str = "segment_details";

    fn resource_key(&self) -> String {
        self.segment_id.to_string()
    }

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }

    fn broken_placeholder(_project: &str, key: &str) -> Self {
        Self::new(
            ModelId::nil(),
            key.parse().unwrap_or_else(|_| SegmentId::nil()),
        )
    }
}

/// Detail store of segments, keyed by segment id.
#[derive(Debug, Clone)]
pub struct SegmentDetailsManager {
    crud: CachedCrud<SegmentDetails>,
}

impl SegmentDetailsManager {
    pub fn new(project: impl Into<String>, store: Arc<dyn ResourceStore>) -> Self {
        Self {
            crud: CachedCrud::new(project, store),
        }
    }

    pub async fn get(&self, segment_id: SegmentId) -> Result<Option<Arc<SegmentDetails>>> {
        Ok(self.crud.get(&segment_id.to_string()).await?)
    }

    /// Adds or replaces `upserts` and drops `removals` in the details of one segment, creating
    /// the details record on first use. Saves only if something changed.
    pub async fn apply_layout_delta(
        &self,
        model_id: ModelId,
        segment_id: SegmentId,
        upserts: &[Layout],
        removals: &BTreeSet<LayoutId>,
    ) -> Result<()> {
        let mut details = match self.get(segment_id).await? {
            Some(current) => self.crud.copy_for_write(&current),
            None => SegmentDetails::new(model_id, segment_id),
        };

        let removed = details.remove_layouts(removals)?;
        let upserted = details.upsert_layouts(upserts)?;
        if removed || upserted {
            let saved = self.crud.save(details).await?;
            tracing::debug!(
                %segment_id,
                upserted = upserts.len(),
                removed = removals.len(),
                layouts = saved.layouts().len(),
                "updated segment details"
            );
        }
        Ok(())
    }

    /// Drops partitions from the layouts of one segment.
    pub async fn remove_partitions(
        &self,
        segment_id: SegmentId,
        layouts: Option<&BTreeSet<LayoutId>>,
        partitions: &BTreeSet<PartitionId>,
    ) -> Result<()> {
        let Some(current) = self.get(segment_id).await? else {
            return Ok(());
        };
        let mut details = self.crud.copy_for_write(&current);
        if details.remove_partitions(layouts, partitions)? {
            self.crud.save(details).await?;
        }
        Ok(())
    }

    /// Deletes the details of a segment. Deleting missing details succeeds.
    pub async fn delete(&self, segment_id: SegmentId) -> Result<()> {
        Ok(self.crud.delete_by_key(&segment_id.to_string()).await?)
    }
}

use crate::offsets::{OffsetManager, OffsetMarker};
use crate::types::{Partition, Record};

/// At-most-once: the offset is marked as soon as the record is pulled, so a crash
/// before the handler finishes loses the record.
pub struct OnPullCommitter {
    marker: OffsetMarker,
}

impl OnPullCommitter {
    pub fn new(marker: OffsetMarker) -> Self {
        Self { marker }
    }
}

impl OffsetManager for OnPullCommitter {
    fn on_pull(&self, record: &Record) {
        self.marker.mark_logged(record.partition(), record.offset());
    }

    fn before_handler(&self, _partition: &Partition, _offset: i64) {}

    fn after_handler(&self, _partition: &Partition, _offset: i64) {}
}

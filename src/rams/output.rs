//! Scheduled RAMS unit output.
//!
//! OUTPUT commands either emit a unit immediately or enqueue an action for
//! a later clock value; clock advance drains the queue in order.

use super::unit::RamsUnitStore;
use crate::ts::{PacketSinkWithMetaData, StreamMetaData};

use log::warn;

use std::collections::VecDeque;

/// In-place patch applied to a unit just before emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchAction {
    pub offset: u32,
    pub patch: Vec<u8>,
}

/// One scheduled emission.
#[derive(Debug, Clone)]
pub struct OutputAction {
    pub unit_id: u16,
    pub clock: u16,
    pub patches: Vec<PatchAction>,
    pub meta_data: StreamMetaData,
}

/// Ordered list of pending output actions.
#[derive(Debug, Default)]
pub struct RamsOutput {
    actions: VecDeque<OutputAction>,
}

impl RamsOutput {
    pub fn new() -> Self {
        RamsOutput::default()
    }

    pub fn reset(&mut self) {
        self.actions.clear();
    }

    pub fn pending(&self) -> usize {
        self.actions.len()
    }

    /// Drop all entries whose scheduled time is at or after `clock`.
    /// A new OUTPUT command replaces everything scheduled from its time on.
    pub fn delete_succeeding_actions(&mut self, clock: u16) {
        if let Some(first) = self.actions.front() {
            let first_clock = first.clock;
            let boundary = clock.wrapping_sub(first_clock);
            while let Some(last) = self.actions.back() {
                if last.clock.wrapping_sub(first_clock) >= boundary {
                    self.actions.pop_back();
                } else {
                    break;
                }
            }
        }
    }

    /// Append an action; it is later than all resident ones because
    /// `delete_succeeding_actions` ran first.
    pub fn add_output_action(&mut self, action: OutputAction) {
        self.actions.push_back(action);
    }

    /// Emit every action scheduled at or before `current_clock`, in
    /// ascending clock order.
    pub fn output_all_units_until(
        &mut self,
        current_clock: u16,
        store: &mut RamsUnitStore,
        out: &mut dyn PacketSinkWithMetaData,
    ) {
        loop {
            match self.actions.front() {
                // Signed wrap comparison: stop at the first future action
                Some(action) if (action.clock.wrapping_sub(current_clock) as i16) <= 0 => {
                    if let Some(action) = self.actions.pop_front() {
                        Self::output_unit(&action, store, out);
                    }
                }
                _ => break,
            }
        }
    }

    /// Apply the action's patches and emit the unit's bytes.
    pub fn output_unit(
        action: &OutputAction,
        store: &mut RamsUnitStore,
        out: &mut dyn PacketSinkWithMetaData,
    ) {
        for patch in &action.patches {
            if !store.apply_patch(action.unit_id as usize, patch.offset as usize, &patch.patch) {
                warn!(
                    "RAMS patch failed (unit={}, offset={})",
                    action.unit_id, patch.offset
                );
            }
        }

        match store.unit(action.unit_id as usize) {
            Some(unit) => {
                out.set_meta_data(&action.meta_data);
                unit.for_each_segment(store.chunk_size(), |segment| out.put(segment));
            }
            None => warn!("RAMS unit not found (id={})", action.unit_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rams::unit::HeapChunkAllocator;
    use crate::ts::PacketSink;

    #[derive(Default)]
    struct CaptureSink {
        data: Vec<u8>,
        metas: Vec<StreamMetaData>,
    }

    impl PacketSink for CaptureSink {
        fn put(&mut self, data: &[u8]) {
            self.data.extend_from_slice(data);
        }
    }

    impl PacketSinkWithMetaData for CaptureSink {
        fn set_meta_data(&mut self, meta: &StreamMetaData) {
            self.metas.push(*meta);
        }
    }

    fn store_with_units() -> RamsUnitStore {
        let mut store = RamsUnitStore::new(Box::new(HeapChunkAllocator::new(64)));
        store.add_bytes(1, &[0x11; 4]);
        store.add_bytes(2, &[0x22; 4]);
        store.add_bytes(3, &[0x33; 4]);
        store
    }

    fn action(unit_id: u16, clock: u16) -> OutputAction {
        OutputAction {
            unit_id,
            clock,
            patches: Vec::new(),
            meta_data: StreamMetaData::clear_ts_with_id(0),
        }
    }

    #[test]
    fn drains_in_clock_order_up_to_current() {
        let mut output = RamsOutput::new();
        let mut store = store_with_units();
        let mut sink = CaptureSink::default();

        output.add_output_action(action(1, 10));
        output.add_output_action(action(2, 20));
        output.add_output_action(action(3, 30));

        output.output_all_units_until(20, &mut store, &mut sink);
        assert_eq!(sink.data, [[0x11u8; 4], [0x22; 4]].concat());
        assert_eq!(output.pending(), 1);

        // Each action is emitted exactly once
        sink.data.clear();
        output.output_all_units_until(20, &mut store, &mut sink);
        assert!(sink.data.is_empty());

        output.output_all_units_until(30, &mut store, &mut sink);
        assert_eq!(sink.data, vec![0x33; 4]);
    }

    #[test]
    fn delete_succeeding_drops_at_or_after_clock() {
        let mut output = RamsOutput::new();
        output.add_output_action(action(1, 10));
        output.add_output_action(action(2, 20));
        output.add_output_action(action(3, 30));

        output.delete_succeeding_actions(20);
        assert_eq!(output.pending(), 1);
        assert_eq!(output.actions.front().unwrap().clock, 10);
    }

    #[test]
    fn patches_are_applied_before_emission() {
        let mut output = RamsOutput::new();
        let mut store = store_with_units();
        let mut sink = CaptureSink::default();

        output.add_output_action(OutputAction {
            unit_id: 1,
            clock: 5,
            patches: vec![PatchAction {
                offset: 1,
                patch: vec![0xAB, 0xCD],
            }],
            meta_data: StreamMetaData::clear_ts(),
        });
        output.output_all_units_until(5, &mut store, &mut sink);
        assert_eq!(sink.data, vec![0x11, 0xAB, 0xCD, 0x11]);
    }
}

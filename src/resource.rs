use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle status of a single work unit. Once `Done` a unit
/// never reverts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceStatus {
    Pending,
    Allocated,
    Done,
}

/// The input a worker receives for one unit, specific to the manager kind
/// that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UnitInput {
    /// Id manager: a bare integer identity.
    Id(u64),
    /// Block manager: a byte range within one input file.
    Block { file: String, offset: u64, size: u64 },
    /// N-line manager: a line-number range within one input file.
    Lines { file: String, start_line: u64, line_count: u64 },
    /// Sequence-file manager: a record-number range within one binary
    /// sequence file.
    Records { file: String, start_record: u64, record_count: u64 },
}

/// One work unit and its current allocation state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    pub unit_no: u64,
    pub input: UnitInput,
    pub status: ResourceStatus,
    /// Highest attempt number issued so far for this unit; 0 means never
    /// allocated.
    pub attempt_no: u32,
}

/// Result of `acquire`/`acquire_specific`: either a freshly-allocated unit,
/// an explicit "nothing left", or "nothing pending right now, try later".
#[derive(Debug, Clone)]
pub enum Acquisition {
    Unit { unit_no: u64, attempt_no: u32, input: UnitInput },
    NoMore,
    Wait,
}

/// Read-only lifecycle counters: total, pending, allocated, done.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceCounters {
    pub total: u64,
    pub pending: u64,
    pub allocated: u64,
    pub done: u64,
}

/// Tagged union over the three Resource Manager kinds, favoring tagged
/// variants over a trait-object hierarchy since a single `Acquire` method
/// switching on the tag simplifies persisting the manager's full state.
/// All three share the unit table below and differ only in how `units`
/// was populated at construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceManager {
    kind: ManagerKind,
    units: HashMap<u64, WorkUnit>,
    order: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagerKind {
    Id,
    Block,
    NLine,
    Sequence,
}

impl ResourceManager {
    /// Id manager: fixed cardinality `count`, units are bare integers
    /// 0..count-1.
    pub fn new_id(count: u64) -> Self {
        let mut units = HashMap::with_capacity(count as usize);
        let mut order = Vec::with_capacity(count as usize);
        for n in 0..count {
            units.insert(
                n,
                WorkUnit {
                    unit_no: n,
                    input: UnitInput::Id(n),
                    status: ResourceStatus::Pending,
                    attempt_no: 0,
                },
            );
            order.push(n);
        }
        Self {
            kind: ManagerKind::Id,
            units,
            order,
        }
    }

    /// Block manager: given `(file, length)` pairs and a target split size
    /// `split_size`, enumerate `ceil(length / split_size)` contiguous byte
    /// ranges per file.
    pub fn new_block(files: &[(String, u64)], split_size: u64) -> Result<Self> {
        if files.is_empty() {
            return Err(CoreError::EmptyInputSet(0));
        }
        let mut units = HashMap::new();
        let mut order = Vec::new();
        let mut unit_no = 0u64;
        for (path, len) in files {
            if *len == 0 {
                continue;
            }
            let mut offset = 0u64;
            while offset < *len {
                let size = split_size.min(len - offset);
                units.insert(
                    unit_no,
                    WorkUnit {
                        unit_no,
                        input: UnitInput::Block {
                            file: path.clone(),
                            offset,
                            size,
                        },
                        status: ResourceStatus::Pending,
                        attempt_no: 0,
                    },
                );
                order.push(unit_no);
                unit_no += 1;
                offset += size;
            }
        }
        if units.is_empty() {
            return Err(CoreError::EmptyInputSet(0));
        }
        Ok(Self {
            kind: ManagerKind::Block,
            units,
            order,
        })
    }

    /// N-line manager: given `(file, line_count)` pairs and a target lines
    /// per unit, produce line-range units rather than byte-range units.
    pub fn new_n_line(files: &[(String, u64)], lines_per_unit: u64) -> Result<Self> {
        if files.is_empty() {
            return Err(CoreError::EmptyInputSet(0));
        }
        let mut units = HashMap::new();
        let mut order = Vec::new();
        let mut unit_no = 0u64;
        for (path, total_lines) in files {
            if *total_lines == 0 {
                continue;
            }
            let mut start = 0u64;
            while start < *total_lines {
                let count = lines_per_unit.min(total_lines - start);
                units.insert(
                    unit_no,
                    WorkUnit {
                        unit_no,
                        input: UnitInput::Lines {
                            file: path.clone(),
                            start_line: start,
                            line_count: count,
                        },
                        status: ResourceStatus::Pending,
                        attempt_no: 0,
                    },
                );
                order.push(unit_no);
                unit_no += 1;
                start += count;
            }
        }
        if units.is_empty() {
            return Err(CoreError::EmptyInputSet(0));
        }
        Ok(Self {
            kind: ManagerKind::NLine,
            units,
            order,
        })
    }

    /// Sequence manager: given `(file, record_count)` pairs and a target
    /// records per unit, produce record-range units against a binary
    /// sequence file the same way `new_n_line` does against line counts.
    pub fn new_sequence(files: &[(String, u64)], records_per_unit: u64) -> Result<Self> {
        if files.is_empty() {
            return Err(CoreError::EmptyInputSet(0));
        }
        let mut units = HashMap::new();
        let mut order = Vec::new();
        let mut unit_no = 0u64;
        for (path, total_records) in files {
            if *total_records == 0 {
                continue;
            }
            let mut start = 0u64;
            while start < *total_records {
                let count = records_per_unit.min(total_records - start);
                units.insert(
                    unit_no,
                    WorkUnit {
                        unit_no,
                        input: UnitInput::Records {
                            file: path.clone(),
                            start_record: start,
                            record_count: count,
                        },
                        status: ResourceStatus::Pending,
                        attempt_no: 0,
                    },
                );
                order.push(unit_no);
                unit_no += 1;
                start += count;
            }
        }
        if units.is_empty() {
            return Err(CoreError::EmptyInputSet(0));
        }
        Ok(Self {
            kind: ManagerKind::Sequence,
            units,
            order,
        })
    }

    pub fn kind(&self) -> ManagerKind {
        self.kind
    }

    /// Returns a pending unit (marking it allocated with a fresh attempt
    /// number), `NoMore` once every unit is done, or `Wait` when none are
    /// pending but some remain allocated.
    pub fn acquire(&mut self) -> Acquisition {
        for &no in &self.order {
            let unit = self.units.get_mut(&no).expect("order/units in sync");
            if unit.status == ResourceStatus::Pending {
                unit.status = ResourceStatus::Allocated;
                unit.attempt_no += 1;
                return Acquisition::Unit {
                    unit_no: unit.unit_no,
                    attempt_no: unit.attempt_no,
                    input: unit.input.clone(),
                };
            }
        }
        if self.counters().allocated == 0 {
            Acquisition::NoMore
        } else {
            Acquisition::Wait
        }
    }

    /// Re-issues a fresh attempt for a unit that is already allocated
    /// (end-game duplicate execution).
    pub fn acquire_specific(&mut self, unit_no: u64) -> Result<Acquisition> {
        let unit = self.units.get_mut(&unit_no).ok_or(CoreError::UnknownUnit(unit_no))?;
        if unit.status != ResourceStatus::Allocated {
            return Ok(Acquisition::NoMore);
        }
        unit.attempt_no += 1;
        Ok(Acquisition::Unit {
            unit_no: unit.unit_no,
            attempt_no: unit.attempt_no,
            input: unit.input.clone(),
        })
    }

    /// Moves a unit back to pending (failure/kill/timeout path).
    pub fn return_unit(&mut self, unit_no: u64) -> Result<()> {
        let unit = self.units.get_mut(&unit_no).ok_or(CoreError::UnknownUnit(unit_no))?;
        if unit.status != ResourceStatus::Done {
            unit.status = ResourceStatus::Pending;
        }
        Ok(())
    }

    /// Atomic compare-and-set allocated -> done. Returns `false` if the
    /// unit was already done, letting the caller reclassify the reporting
    /// attempt as canceled instead of completed.
    pub fn complete(&mut self, unit_no: u64) -> Result<bool> {
        let unit = self.units.get_mut(&unit_no).ok_or(CoreError::UnknownUnit(unit_no))?;
        if unit.status == ResourceStatus::Done {
            return Ok(false);
        }
        unit.status = ResourceStatus::Done;
        Ok(true)
    }

    pub fn is_done(&self, unit_no: u64) -> bool {
        self.units
            .get(&unit_no)
            .map(|u| u.status == ResourceStatus::Done)
            .unwrap_or(false)
    }

    /// Units currently allocated but not done, in stable order — the
    /// candidate pool for the end-game slug queue.
    pub fn allocated_units(&self) -> Vec<u64> {
        self.order
            .iter()
            .copied()
            .filter(|no| self.units[no].status == ResourceStatus::Allocated)
            .collect()
    }

    /// Moves every allocated unit back to pending. Used on coordinator
    /// restart: attempts that were running when the last
    /// checkpoint was taken are never resumed in-flight.
    pub fn reset_in_flight(&mut self) {
        for unit in self.units.values_mut() {
            if unit.status == ResourceStatus::Allocated {
                unit.status = ResourceStatus::Pending;
            }
        }
    }

    pub fn counters(&self) -> ResourceCounters {
        let mut c = ResourceCounters::default();
        for unit in self.units.values() {
            c.total += 1;
            match unit.status {
                ResourceStatus::Pending => c.pending += 1,
                ResourceStatus::Allocated => c.allocated += 1,
                ResourceStatus::Done => c.done += 1,
            }
        }
        c
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_manager_acquire_then_complete() {
        let mut mgr = ResourceManager::new_id(3);
        let a = mgr.acquire();
        assert!(matches!(a, Acquisition::Unit { unit_no: 0, attempt_no: 1, .. }));
        assert!(mgr.complete(0).unwrap());
        assert!(!mgr.complete(0).unwrap()); // already done
    }

    #[test]
    fn acquire_returns_wait_then_no_more() {
        let mut mgr = ResourceManager::new_id(1);
        let _ = mgr.acquire();
        assert!(matches!(mgr.acquire(), Acquisition::Wait));
        mgr.complete(0).unwrap();
        assert!(matches!(mgr.acquire(), Acquisition::NoMore));
    }

    #[test]
    fn return_moves_back_to_pending() {
        let mut mgr = ResourceManager::new_id(1);
        let _ = mgr.acquire();
        mgr.return_unit(0).unwrap();
        assert!(matches!(mgr.acquire(), Acquisition::Unit { unit_no: 0, attempt_no: 2, .. }));
    }

    #[test]
    fn complete_unknown_unit_is_a_fault_not_a_crash() {
        let mut mgr = ResourceManager::new_id(1);
        assert!(mgr.complete(99).is_err());
    }

    #[test]
    fn acquire_specific_bumps_attempt_for_allocated_unit() {
        let mut mgr = ResourceManager::new_id(1);
        mgr.acquire();
        let dup = mgr.acquire_specific(0).unwrap();
        assert!(matches!(dup, Acquisition::Unit { unit_no: 0, attempt_no: 2, .. }));
    }

    #[test]
    fn block_manager_splits_into_contiguous_ranges() {
        let mgr = ResourceManager::new_block(&[("a.txt".to_string(), 250)], 100).unwrap();
        assert_eq!(mgr.counters().total, 3);
    }

    #[test]
    fn sequence_manager_splits_into_record_ranges() {
        let mgr = ResourceManager::new_sequence(&[("a.seq".to_string(), 25)], 10).unwrap();
        assert_eq!(mgr.counters().total, 3);
        assert_eq!(mgr.kind(), ManagerKind::Sequence);
    }

    #[test]
    fn reset_in_flight_returns_allocated_units_to_pending() {
        let mut mgr = ResourceManager::new_id(2);
        mgr.acquire();
        mgr.acquire();
        mgr.complete(0).unwrap();
        mgr.reset_in_flight();
        let c = mgr.counters();
        assert_eq!(c.done, 1);
        assert_eq!(c.pending, 1);
        assert_eq!(c.allocated, 0);
    }

    #[test]
    fn counters_balance_across_lifecycle() {
        let mut mgr = ResourceManager::new_id(5);
        for _ in 0..3 {
            mgr.acquire();
        }
        mgr.complete(0).unwrap();
        let c = mgr.counters();
        assert_eq!(c.total, 5);
        assert_eq!(c.done, 1);
        assert_eq!(c.allocated, 2);
        assert_eq!(c.pending, 2);
        assert_eq!(c.done + c.pending + c.allocated, c.total);
    }
}

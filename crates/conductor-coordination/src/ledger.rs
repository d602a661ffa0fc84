use conductor_core::{AgentId, ConductorError, ConductorResult, ResourceAmounts};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
struct LedgerEntry {
    max_capacity: ResourceAmounts,
    in_use: ResourceAmounts,
}

impl LedgerEntry {
    /// All-or-nothing capacity check, reporting the first resource that does not fit.
    fn check_fits(&self, agent: &AgentId, amounts: &ResourceAmounts) -> ConductorResult<()> {
        for (resource, requested) in amounts.iter() {
            let available = self.max_capacity.get(resource) - self.in_use.get(resource);
            if requested > available + conductor_core::resource::QUANTITY_EPSILON {
                return Err(ConductorError::CapacityExceeded {
                    agent: agent.clone(),
                    resource: resource.clone(),
                    requested,
                    available: available.max(0.0),
                });
            }
        }
        Ok(())
    }

    fn check_held(&self, agent: &AgentId, amounts: &ResourceAmounts) -> ConductorResult<()> {
        if amounts.fits_within(&self.in_use) {
            Ok(())
        } else {
            Err(ConductorError::InvalidState(format!(
                "agent {agent} does not hold the amounts being moved"
            )))
        }
    }
}

/// Read-only view of one agent's ledger entry.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerView {
    pub agent_id: AgentId,
    pub max_capacity: ResourceAmounts,
    pub in_use: ResourceAmounts,
}

/// Per-agent capacity accounting.
///
/// Each agent's entry is its own critical section: operations on different
/// agents never block each other, operations on the same agent serialize.
/// The outer map lock is only held long enough to look an entry up.
#[derive(Default)]
pub struct ResourceLedger {
    entries: RwLock<HashMap<AgentId, Arc<Mutex<LedgerEntry>>>>,
    /// Bumped whenever capacity may have become available.
    generation: AtomicU64,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an agent's capacity. Fails with `DuplicateAgent` if already present.
    pub fn register(&self, agent: &AgentId, max_capacity: ResourceAmounts) -> ConductorResult<()> {
        if let Some((resource, quantity)) = max_capacity.first_invalid() {
            return Err(ConductorError::InvalidRequest(format!(
                "capacity for {resource} must be a non-negative number, got {quantity}"
            )));
        }
        let mut entries = self.entries.write();
        if entries.contains_key(agent) {
            return Err(ConductorError::DuplicateAgent(agent.clone()));
        }
        entries.insert(
            agent.clone(),
            Arc::new(Mutex::new(LedgerEntry {
                max_capacity,
                in_use: ResourceAmounts::new(),
            })),
        );
        self.bump();
        Ok(())
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Counter that changes after every registration, release and transfer.
    /// Two equal readings mean no capacity was freed in between.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Remove an agent. Refused while it still has resources in use.
    pub fn deregister(&self, agent: &AgentId) -> ConductorResult<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .get(agent)
            .ok_or_else(|| ConductorError::UnknownAgent(agent.clone()))?;
        if !entry.lock().in_use.is_empty() {
            return Err(ConductorError::InvalidState(format!(
                "agent {agent} still has resources in use"
            )));
        }
        entries.remove(agent);
        Ok(())
    }

    pub fn contains(&self, agent: &AgentId) -> bool {
        self.entries.read().contains_key(agent)
    }

    fn entry(&self, agent: &AgentId) -> ConductorResult<Arc<Mutex<LedgerEntry>>> {
        self.entries
            .read()
            .get(agent)
            .cloned()
            .ok_or_else(|| ConductorError::UnknownAgent(agent.clone()))
    }

    /// Atomically reserve `amounts` on `agent`.
    ///
    /// Every requested resource must satisfy `in_use + requested <= max_capacity`;
    /// if any one fails nothing is reserved.
    pub fn try_reserve(&self, agent: &AgentId, amounts: &ResourceAmounts) -> ConductorResult<ResourceAmounts> {
        if let Some((resource, quantity)) = amounts.first_invalid() {
            return Err(ConductorError::InvalidRequest(format!(
                "requested {resource} must be a non-negative number, got {quantity}"
            )));
        }
        let entry = self.entry(agent)?;
        let mut entry = entry.lock();
        entry.check_fits(agent, amounts)?;
        entry.in_use.add(amounts);
        debug!(agent = %agent, amounts = ?amounts, "Reserved resources");
        Ok(amounts.clone())
    }

    /// Check a reservation without committing it.
    pub fn check_reserve(&self, agent: &AgentId, amounts: &ResourceAmounts) -> ConductorResult<()> {
        self.entry(agent)?.lock().check_fits(agent, amounts)
    }

    /// Whether a reservation would currently succeed.
    pub fn can_reserve(&self, agent: &AgentId, amounts: &ResourceAmounts) -> bool {
        self.check_reserve(agent, amounts).is_ok()
    }

    /// Return previously reserved amounts. Over-release clamps at zero.
    pub fn release(&self, agent: &AgentId, amounts: &ResourceAmounts) -> ConductorResult<()> {
        let entry = self.entry(agent)?;
        entry.lock().in_use.saturating_sub(amounts);
        self.bump();
        debug!(agent = %agent, amounts = ?amounts, "Released resources");
        Ok(())
    }

    /// Move `amounts` from one agent's ledger entry to another's in a single step.
    ///
    /// Both entries are locked in agent-id order so concurrent transfers in
    /// opposite directions cannot deadlock. Either both sides change or neither.
    pub fn transfer(&self, from: &AgentId, to: &AgentId, amounts: &ResourceAmounts) -> ConductorResult<()> {
        if from == to {
            return Ok(());
        }
        let source = self.entry(from)?;
        let destination = self.entry(to)?;

        let (first, second) = if from < to {
            (&source, &destination)
        } else {
            (&destination, &source)
        };
        let mut first_guard = first.lock();
        let mut second_guard = second.lock();
        let (src, dst) = if from < to {
            (&mut *first_guard, &mut *second_guard)
        } else {
            (&mut *second_guard, &mut *first_guard)
        };

        src.check_held(from, amounts)?;
        dst.check_fits(to, amounts)?;
        src.in_use.saturating_sub(amounts);
        dst.in_use.add(amounts);
        self.bump();
        debug!(from = %from, to = %to, amounts = ?amounts, "Transferred resources");
        Ok(())
    }

    pub fn in_use(&self, agent: &AgentId) -> ConductorResult<ResourceAmounts> {
        Ok(self.entry(agent)?.lock().in_use.clone())
    }

    pub fn capacity(&self, agent: &AgentId) -> ConductorResult<ResourceAmounts> {
        Ok(self.entry(agent)?.lock().max_capacity.clone())
    }

    /// Σ in_use / Σ max_capacity over the given resource types, or over every
    /// declared type when `over` is `None`. An agent with no capacity in those
    /// types reports 0.
    pub fn utilization(&self, agent: &AgentId, over: Option<&ResourceAmounts>) -> ConductorResult<f64> {
        let entry = self.entry(agent)?;
        let entry = entry.lock();
        let (used, max) = match over {
            Some(requested) => requested.resource_types().fold((0.0, 0.0), |(u, m), r| {
                (u + entry.in_use.get(r), m + entry.max_capacity.get(r))
            }),
            None => (entry.in_use.total(), entry.max_capacity.total()),
        };
        if max <= 0.0 {
            return Ok(0.0);
        }
        Ok((used / max).clamp(0.0, 1.0))
    }

    /// Snapshot of every entry, sorted by agent id.
    pub fn snapshot(&self) -> Vec<LedgerView> {
        let entries: Vec<(AgentId, Arc<Mutex<LedgerEntry>>)> = self
            .entries
            .read()
            .iter()
            .map(|(id, e)| (id.clone(), Arc::clone(e)))
            .collect();
        let mut views: Vec<LedgerView> = entries
            .into_iter()
            .map(|(agent_id, entry)| {
                let entry = entry.lock();
                LedgerView {
                    agent_id,
                    max_capacity: entry.max_capacity.clone(),
                    in_use: entry.in_use.clone(),
                }
            })
            .collect();
        views.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        views
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conductor_core::ResourceType;

    fn cpu_mem(cpu: f64, mem: f64) -> ResourceAmounts {
        ResourceAmounts::new()
            .with(ResourceType::Cpu, cpu)
            .with(ResourceType::Memory, mem)
    }

    fn ledger_with(agents: &[(&str, f64)]) -> ResourceLedger {
        let ledger = ResourceLedger::new();
        for (id, cpu) in agents {
            ledger
                .register(&AgentId::from(*id), cpu_mem(*cpu, 8192.0))
                .unwrap();
        }
        ledger
    }

    #[test]
    fn test_register_duplicate() {
        let ledger = ledger_with(&[("a", 4.0)]);
        let err = ledger.register(&AgentId::from("a"), cpu_mem(1.0, 1.0)).unwrap_err();
        assert!(matches!(err, ConductorError::DuplicateAgent(_)));
    }

    #[test]
    fn test_register_rejects_negative_capacity() {
        let ledger = ResourceLedger::new();
        let err = ledger
            .register(&AgentId::from("a"), ResourceAmounts::new().with(ResourceType::Cpu, -2.0))
            .unwrap_err();
        assert!(matches!(err, ConductorError::InvalidRequest(_)));
    }

    #[test]
    fn test_reserve_and_release() {
        let ledger = ledger_with(&[("a", 4.0)]);
        let a = AgentId::from("a");
        ledger.try_reserve(&a, &cpu_mem(2.0, 4096.0)).unwrap();
        assert_eq!(ledger.in_use(&a).unwrap().get(&ResourceType::Cpu), 2.0);

        let err = ledger
            .try_reserve(&a, &ResourceAmounts::new().with(ResourceType::Cpu, 3.0))
            .unwrap_err();
        match err {
            ConductorError::CapacityExceeded { requested, available, .. } => {
                assert_eq!(requested, 3.0);
                assert_eq!(available, 2.0);
            }
            other => panic!("unexpected error: {other}"),
        }

        ledger.release(&a, &cpu_mem(2.0, 4096.0)).unwrap();
        assert!(ledger.in_use(&a).unwrap().is_empty());
    }

    #[test]
    fn test_generation_moves_only_when_capacity_frees() {
        let ledger = ledger_with(&[("a", 4.0), ("b", 4.0)]);
        let a = AgentId::from("a");
        let start = ledger.generation();
        ledger.try_reserve(&a, &cpu_mem(2.0, 0.0)).unwrap();
        assert!(ledger.try_reserve(&a, &cpu_mem(3.0, 0.0)).is_err());
        assert_eq!(ledger.generation(), start);

        ledger.release(&a, &cpu_mem(1.0, 0.0)).unwrap();
        let after_release = ledger.generation();
        assert!(after_release > start);
        ledger
            .transfer(&a, &AgentId::from("b"), &cpu_mem(1.0, 0.0))
            .unwrap();
        assert!(ledger.generation() > after_release);
    }

    #[test]
    fn test_reserve_is_all_or_nothing() {
        let ledger = ledger_with(&[("a", 4.0)]);
        let a = AgentId::from("a");
        // CPU fits, memory does not.
        let err = ledger.try_reserve(&a, &cpu_mem(1.0, 10_000.0)).unwrap_err();
        assert!(matches!(err, ConductorError::CapacityExceeded { .. }));
        assert!(ledger.in_use(&a).unwrap().is_empty());
    }

    #[test]
    fn test_undeclared_resource_has_no_capacity() {
        let ledger = ledger_with(&[("a", 4.0)]);
        let gpu = ResourceAmounts::new().with(ResourceType::Gpu, 1.0);
        assert!(!ledger.can_reserve(&AgentId::from("a"), &gpu));
    }

    #[test]
    fn test_transfer_conserves_totals() {
        let ledger = ledger_with(&[("a", 4.0), ("b", 4.0)]);
        let (a, b) = (AgentId::from("a"), AgentId::from("b"));
        let two_cpu = ResourceAmounts::new().with(ResourceType::Cpu, 2.0);
        ledger.try_reserve(&a, &two_cpu).unwrap();

        ledger.transfer(&a, &b, &two_cpu).unwrap();
        assert_eq!(ledger.in_use(&a).unwrap().get(&ResourceType::Cpu), 0.0);
        assert_eq!(ledger.in_use(&b).unwrap().get(&ResourceType::Cpu), 2.0);
    }

    #[test]
    fn test_transfer_fails_without_partial_effect() {
        let ledger = ledger_with(&[("a", 4.0), ("b", 1.0)]);
        let (a, b) = (AgentId::from("a"), AgentId::from("b"));
        let two_cpu = ResourceAmounts::new().with(ResourceType::Cpu, 2.0);
        ledger.try_reserve(&a, &two_cpu).unwrap();

        let err = ledger.transfer(&a, &b, &two_cpu).unwrap_err();
        assert!(matches!(err, ConductorError::CapacityExceeded { .. }));
        assert_eq!(ledger.in_use(&a).unwrap().get(&ResourceType::Cpu), 2.0);
        assert_eq!(ledger.in_use(&b).unwrap().get(&ResourceType::Cpu), 0.0);
    }

    #[test]
    fn test_transfer_requires_source_holding() {
        let ledger = ledger_with(&[("a", 4.0), ("b", 4.0)]);
        let err = ledger
            .transfer(
                &AgentId::from("a"),
                &AgentId::from("b"),
                &ResourceAmounts::new().with(ResourceType::Cpu, 1.0),
            )
            .unwrap_err();
        assert!(matches!(err, ConductorError::InvalidState(_)));
    }

    #[test]
    fn test_utilization() {
        let ledger = ledger_with(&[("a", 4.0)]);
        let a = AgentId::from("a");
        ledger
            .try_reserve(&a, &ResourceAmounts::new().with(ResourceType::Cpu, 1.0))
            .unwrap();
        let cpu_only = ResourceAmounts::new().with(ResourceType::Cpu, 0.0);
        assert!((ledger.utilization(&a, Some(&cpu_only)).unwrap() - 0.25).abs() < 1e-9);
        let gpu_only = ResourceAmounts::new().with(ResourceType::Gpu, 0.0);
        assert_eq!(ledger.utilization(&a, Some(&gpu_only)).unwrap(), 0.0);
    }

    #[test]
    fn test_deregister_refused_while_in_use() {
        let ledger = ledger_with(&[("a", 4.0)]);
        let a = AgentId::from("a");
        let one = ResourceAmounts::new().with(ResourceType::Cpu, 1.0);
        ledger.try_reserve(&a, &one).unwrap();
        assert!(ledger.deregister(&a).is_err());
        ledger.release(&a, &one).unwrap();
        ledger.deregister(&a).unwrap();
        assert!(!ledger.contains(&a));
    }

    #[test]
    fn test_concurrent_reservations_never_exceed_capacity() {
        let ledger = Arc::new(ledger_with(&[("a", 10.0)]));
        let one = ResourceAmounts::new().with(ResourceType::Cpu, 1.0);
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                let one = one.clone();
                std::thread::spawn(move || ledger.try_reserve(&AgentId::from("a"), &one).is_ok())
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(granted, 10);
        assert_eq!(
            ledger.in_use(&AgentId::from("a")).unwrap().get(&ResourceType::Cpu),
            10.0
        );
    }

    #[test]
    fn test_opposite_transfers_do_not_deadlock() {
        let ledger = Arc::new(ledger_with(&[("a", 100.0), ("b", 100.0)]));
        let one = ResourceAmounts::new().with(ResourceType::Cpu, 1.0);
        let fifty = ResourceAmounts::new().with(ResourceType::Cpu, 50.0);
        ledger.try_reserve(&AgentId::from("a"), &fifty).unwrap();
        ledger.try_reserve(&AgentId::from("b"), &fifty).unwrap();

        let spawn = |from: &'static str, to: &'static str| {
            let ledger = Arc::clone(&ledger);
            let one = one.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    let _ = ledger.transfer(&AgentId::from(from), &AgentId::from(to), &one);
                }
            })
        };
        let t1 = spawn("a", "b");
        let t2 = spawn("b", "a");
        t1.join().unwrap();
        t2.join().unwrap();

        let total = ledger.in_use(&AgentId::from("a")).unwrap().get(&ResourceType::Cpu)
            + ledger.in_use(&AgentId::from("b")).unwrap().get(&ResourceType::Cpu);
        assert!((total - 100.0).abs() < 1e-9);
    }
}

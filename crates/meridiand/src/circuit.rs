//! Expected circuits. Login registers a circuit code with the identity the
//! client will present; `UseCircuitCode` is only accepted against one.
//! Circuits listed in config are registered at startup.

use std::sync::Arc;

use dashmap::DashMap;

use meridian_core::config::CircuitConfig;
use meridian_core::packets::UseCircuitCode;
use meridian_core::wire::{Uuid, UUID_ZERO};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitData {
    pub circuit_code: u32,
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub secure_session_id: Uuid,
}

impl CircuitData {
    pub fn from_config(entry: &CircuitConfig) -> Option<Self> {
        Some(Self {
            circuit_code: entry.circuit_code,
            agent_id: parse_uuid(&entry.agent_id)?,
            session_id: parse_uuid(&entry.session_id)?,
            secure_session_id: if entry.secure_session_id.is_empty() {
                UUID_ZERO
            } else {
                parse_uuid(&entry.secure_session_id)?
            },
        })
    }
}

fn parse_uuid(text: &str) -> Option<Uuid> {
    let bytes = hex::decode(text.replace('-', "")).ok()?;
    Uuid::try_from(bytes.as_slice()).ok()
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CircuitError {
    #[error("unknown circuit code {0}")]
    UnknownCode(u32),
    #[error("circuit {0} presented a different agent or session")]
    IdentityMismatch(u32),
}

#[derive(Clone, Default)]
pub struct CircuitManager {
    circuits: Arc<DashMap<u32, CircuitData>>,
}

impl CircuitManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by login before the client connects.
    pub fn add_circuit(&self, circuit: CircuitData) {
        tracing::debug!(
            code = circuit.circuit_code,
            agent = hex::encode(circuit.agent_id),
            "circuit expected"
        );
        self.circuits.insert(circuit.circuit_code, circuit);
    }

    /// Register the circuits listed in config. Entries with malformed ids
    /// are skipped. Returns how many were added.
    pub fn apply_config(&self, circuits: &[CircuitConfig]) -> usize {
        let mut added = 0;
        for entry in circuits {
            match CircuitData::from_config(entry) {
                Some(circuit) => {
                    self.add_circuit(circuit);
                    added += 1;
                }
                None => tracing::warn!(
                    code = entry.circuit_code,
                    "ignoring configured circuit with malformed ids"
                ),
            }
        }
        added
    }

    pub fn remove_circuit(&self, code: u32) -> Option<CircuitData> {
        self.circuits.remove(&code).map(|(_, c)| c)
    }

    /// Check a UseCircuitCode against the expected circuits.
    pub fn authorize(&self, request: &UseCircuitCode) -> Result<CircuitData, CircuitError> {
        let circuit = self
            .circuits
            .get(&request.code)
            .map(|c| c.value().clone())
            .ok_or(CircuitError::UnknownCode(request.code))?;
        if circuit.agent_id != request.agent_id || circuit.session_id != request.session_id {
            return Err(CircuitError::IdentityMismatch(request.code));
        }
        Ok(circuit)
    }

    pub fn len(&self) -> usize {
        self.circuits.len()
    }
}

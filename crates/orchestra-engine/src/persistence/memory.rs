// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory store.
//!
//! Backs transient processes and tests. Nothing survives the process.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

use super::{
    InstanceRecord, InstanceState, MessageRoute, ProcessEventRecord, ProcessRecord, Store,
};
use crate::correlation::CorrelationKey;
use crate::error::{EngineError, Result};
use crate::exchange::{Direction, ExchangeRecord, InvocationStyle};
use crate::ids::{InstanceId, ProcessId};

type CorrelatorSlot = (ProcessId, String, CorrelationKey);

#[derive(Default)]
struct Tables {
    next_instance_id: InstanceId,
    processes: HashMap<ProcessId, ProcessRecord>,
    instances: HashMap<InstanceId, InstanceRecord>,
    exchanges: HashMap<String, ExchangeRecord>,
    routes: HashMap<CorrelatorSlot, VecDeque<MessageRoute>>,
    queued: HashMap<CorrelatorSlot, VecDeque<String>>,
    events: Vec<ProcessEventRecord>,
}

/// Store keeping every table in process memory.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.lock();
        f.debug_struct("MemoryStore")
            .field("processes", &tables.processes.len())
            .field("instances", &tables.instances.len())
            .field("exchanges", &tables.exchanges.len())
            .finish()
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded events, oldest first.
    pub fn events(&self) -> Vec<ProcessEventRecord> {
        self.tables.lock().events.clone()
    }

    /// Number of messages waiting on a correlator.
    pub fn queued_messages(
        &self,
        process_id: &ProcessId,
        correlator_id: &str,
        key: &CorrelationKey,
    ) -> usize {
        let slot = (process_id.clone(), correlator_id.to_string(), key.clone());
        self.tables.lock().queued.get(&slot).map_or(0, VecDeque::len)
    }

    /// Number of process records.
    pub fn process_count(&self) -> usize {
        self.tables.lock().processes.len()
    }
}

impl Tables {
    fn pop_route(&mut self, slot: &CorrelatorSlot) -> Option<MessageRoute> {
        let route = self.routes.get_mut(slot).and_then(VecDeque::pop_front);
        if self.routes.get(slot).is_some_and(VecDeque::is_empty) {
            self.routes.remove(slot);
        }
        route
    }
}

fn slot(process_id: &ProcessId, correlator_id: &str, key: &CorrelationKey) -> CorrelatorSlot {
    (process_id.clone(), correlator_id.to_string(), key.clone())
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_process(&self, process_id: &ProcessId) -> Result<Option<ProcessRecord>> {
        Ok(self.tables.lock().processes.get(process_id).cloned())
    }

    async fn create_process(&self, record: ProcessRecord) -> Result<()> {
        let mut tables = self.tables.lock();
        if tables.processes.contains_key(&record.process_id) {
            return Err(EngineError::storage(
                "create_process",
                format!("process {} already exists", record.process_id),
            ));
        }
        tables.processes.insert(record.process_id.clone(), record);
        Ok(())
    }

    async fn delete_process(&self, process_id: &ProcessId) -> Result<()> {
        let mut tables = self.tables.lock();
        tables.processes.remove(process_id);
        tables.instances.retain(|_, inst| &inst.process_id != process_id);
        tables.routes.retain(|(pid, _, _), _| pid != process_id);
        tables.queued.retain(|(pid, _, _), _| pid != process_id);
        Ok(())
    }

    async fn create_instance(
        &self,
        process_id: &ProcessId,
        created_by: Option<&str>,
    ) -> Result<InstanceRecord> {
        let mut tables = self.tables.lock();
        if !tables.processes.contains_key(process_id) {
            return Err(EngineError::storage(
                "create_instance",
                format!("process {} has no record", process_id),
            ));
        }
        tables.next_instance_id += 1;
        let now = Utc::now();
        let record = InstanceRecord {
            instance_id: tables.next_instance_id,
            process_id: process_id.clone(),
            state: InstanceState::Active,
            created_by: created_by.map(str::to_string),
            created_at: now,
            last_active_at: now,
        };
        tables.instances.insert(record.instance_id, record.clone());
        Ok(record)
    }

    async fn get_instance(&self, instance_id: InstanceId) -> Result<Option<InstanceRecord>> {
        Ok(self.tables.lock().instances.get(&instance_id).cloned())
    }

    async fn update_instance_state(
        &self,
        instance_id: InstanceId,
        state: InstanceState,
    ) -> Result<()> {
        let mut tables = self.tables.lock();
        let instance = tables.instances.get_mut(&instance_id).ok_or_else(|| {
            EngineError::storage(
                "update_instance_state",
                format!("instance {} not found", instance_id),
            )
        })?;
        instance.state = state;
        instance.last_active_at = Utc::now();
        Ok(())
    }

    async fn delete_instance(&self, instance_id: InstanceId) -> Result<()> {
        let mut tables = self.tables.lock();
        tables.instances.remove(&instance_id);
        for routes in tables.routes.values_mut() {
            routes.retain(|route| route.instance_id != instance_id);
        }
        Ok(())
    }

    async fn create_message_exchange(
        &self,
        exchange_id: &str,
        direction: Direction,
        style: InvocationStyle,
    ) -> Result<ExchangeRecord> {
        let mut tables = self.tables.lock();
        if tables.exchanges.contains_key(exchange_id) {
            return Err(EngineError::storage(
                "create_message_exchange",
                format!("message exchange {} already exists", exchange_id),
            ));
        }
        let record = ExchangeRecord::new(exchange_id, direction, style);
        tables.exchanges.insert(exchange_id.to_string(), record.clone());
        Ok(record)
    }

    async fn get_message_exchange(&self, exchange_id: &str) -> Result<Option<ExchangeRecord>> {
        Ok(self.tables.lock().exchanges.get(exchange_id).cloned())
    }

    async fn save_message_exchange(&self, exchange: &ExchangeRecord) -> Result<()> {
        self.tables
            .lock()
            .exchanges
            .insert(exchange.id.clone(), exchange.clone());
        Ok(())
    }

    async fn take_route(
        &self,
        process_id: &ProcessId,
        correlator_id: &str,
        key: &CorrelationKey,
    ) -> Result<Option<MessageRoute>> {
        Ok(self
            .tables
            .lock()
            .pop_route(&slot(process_id, correlator_id, key)))
    }

    async fn take_route_or_enqueue(
        &self,
        process_id: &ProcessId,
        correlator_id: &str,
        key: &CorrelationKey,
        exchange_id: &str,
    ) -> Result<Option<MessageRoute>> {
        let mut tables = self.tables.lock();
        let slot = slot(process_id, correlator_id, key);
        if let Some(route) = tables.pop_route(&slot) {
            return Ok(Some(route));
        }
        tables
            .queued
            .entry(slot)
            .or_default()
            .push_back(exchange_id.to_string());
        Ok(None)
    }

    async fn dequeue_or_add_route(
        &self,
        process_id: &ProcessId,
        correlator_id: &str,
        key: &CorrelationKey,
        route: MessageRoute,
    ) -> Result<Option<String>> {
        let mut tables = self.tables.lock();
        let slot = slot(process_id, correlator_id, key);
        let queued = tables.queued.get_mut(&slot).and_then(VecDeque::pop_front);
        if tables.queued.get(&slot).is_some_and(VecDeque::is_empty) {
            tables.queued.remove(&slot);
        }
        if queued.is_none() {
            tables.routes.entry(slot).or_default().push_back(route);
        }
        Ok(queued)
    }

    async fn insert_event(&self, event: ProcessEventRecord) -> Result<()> {
        self.tables.lock().events.push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::ReceiveToken;
    use std::sync::Arc;

    fn process_record(pid: &ProcessId) -> ProcessRecord {
        ProcessRecord {
            process_id: pid.clone(),
            definition_name: "order".to_string(),
            guid: "abc".to_string(),
            version: 1,
            correlators: vec!["1.place".to_string()],
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_instances_require_process_record() {
        let store = MemoryStore::new();
        let pid = ProcessId::new("{urn:test}order");

        assert!(store.create_instance(&pid, None).await.is_err());

        store.create_process(process_record(&pid)).await.unwrap();
        let first = store.create_instance(&pid, Some("mex-1")).await.unwrap();
        let second = store.create_instance(&pid, None).await.unwrap();
        assert_ne!(first.instance_id, second.instance_id);
        assert_eq!(first.created_by.as_deref(), Some("mex-1"));

        store.delete_process(&pid).await.unwrap();
        assert!(store.get_instance(first.instance_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_route_matches_once() {
        let store = MemoryStore::new();
        let pid = ProcessId::new("{urn:test}order");
        let key = CorrelationKey::new(vec!["A-17".to_string()]);
        let route = MessageRoute {
            instance_id: 3,
            token: ReceiveToken::new("g1", 0),
        };

        let queued = store
            .dequeue_or_add_route(&pid, "1.notify", &key, route.clone())
            .await
            .unwrap();
        assert_eq!(queued, None);
        assert_eq!(
            store.take_route_or_enqueue(&pid, "1.notify", &key, "m1").await.unwrap(),
            Some(route)
        );
        assert_eq!(store.take_route(&pid, "1.notify", &key).await.unwrap(), None);
        assert_eq!(store.queued_messages(&pid, "1.notify", &key), 0);
    }

    #[tokio::test]
    async fn test_queued_messages_are_fifo() {
        let store = MemoryStore::new();
        let pid = ProcessId::new("{urn:test}order");
        let key = CorrelationKey::new(vec!["A-17".to_string()]);
        let route = || MessageRoute {
            instance_id: 3,
            token: ReceiveToken::new("g1", 0),
        };

        assert_eq!(store.take_route_or_enqueue(&pid, "1.notify", &key, "m1").await.unwrap(), None);
        assert_eq!(store.take_route_or_enqueue(&pid, "1.notify", &key, "m2").await.unwrap(), None);
        assert_eq!(store.queued_messages(&pid, "1.notify", &key), 2);

        assert_eq!(
            store.dequeue_or_add_route(&pid, "1.notify", &key, route()).await.unwrap().as_deref(),
            Some("m1")
        );
        assert_eq!(
            store.dequeue_or_add_route(&pid, "1.notify", &key, route()).await.unwrap().as_deref(),
            Some("m2")
        );
        assert_eq!(store.take_route(&pid, "1.notify", &key).await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_receive_and_arrival_always_meet() {
        let store = Arc::new(MemoryStore::new());
        let pid = ProcessId::new("{urn:test}order");

        let mut tasks = Vec::new();
        for n in 0..200 {
            let key = CorrelationKey::new(vec![format!("K-{}", n)]);
            let receiving = {
                let (store, pid, key) = (store.clone(), pid.clone(), key.clone());
                tokio::spawn(async move {
                    let route = MessageRoute {
                        instance_id: n,
                        token: ReceiveToken::new("g1", 0),
                    };
                    store.dequeue_or_add_route(&pid, "1.notify", &key, route).await.unwrap()
                })
            };
            let arriving = {
                let (store, pid, key) = (store.clone(), pid.clone(), key.clone());
                tokio::spawn(async move {
                    store
                        .take_route_or_enqueue(&pid, "1.notify", &key, &format!("m{}", n))
                        .await
                        .unwrap()
                })
            };
            tasks.push((key, receiving, arriving));
        }

        for (key, receiving, arriving) in tasks {
            let dequeued = receiving.await.unwrap();
            let routed = arriving.await.unwrap();
            assert!(
                dequeued.is_some() != routed.is_some(),
                "exactly one side sees the other for {}",
                key
            );
            assert_eq!(store.queued_messages(&pid, "1.notify", &key), 0);
            assert_eq!(store.take_route(&pid, "1.notify", &key).await.unwrap(), None);
        }
    }
}

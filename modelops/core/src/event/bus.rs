// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Event bus abstraction
//!
//! Per-subject FIFO, at-least-once delivery to named consumer groups.
//! Members of one group compete for deliveries; a nack puts the message
//! back at the front of the group queue with its delivery count
//! incremented, so consumers can cap redeliveries.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::Result;

/// One message handed to a consumer. `deliveries` starts at 1 and grows
/// on every redelivery.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub subject: String,
    pub body: Vec<u8>,
    pub deliveries: u32,
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, subject: &str, body: Vec<u8>) -> Result<()>;

    /// Join (or create) the consumer group `group` over `subjects`.
    /// Deliveries for all subscribed subjects arrive interleaved on the
    /// returned subscription, FIFO within each subject.
    async fn subscribe(
        &self,
        subjects: &[&str],
        group: &str,
    ) -> Result<Box<dyn Subscription>>;
}

#[async_trait]
pub trait Subscription: Send {
    /// The next delivery for this group. Waits until one is available.
    async fn next(&mut self) -> Delivery;

    /// Acknowledge a processed delivery.
    async fn ack(&mut self, delivery: Delivery) -> Result<()>;

    /// Return a delivery for redelivery.
    async fn nack(&mut self, delivery: Delivery) -> Result<()>;
}

struct GroupShared {
    queue: Mutex<VecDeque<Delivery>>,
    notify: Notify,
}

#[derive(Default)]
struct BusState {
    groups: HashMap<String, Arc<GroupShared>>,
    // subject -> groups subscribed to it
    routes: HashMap<String, Vec<String>>,
}

/// Process-local [`EventBus`]. Events published to a subject nobody has
/// subscribed to are dropped; that is acceptable here because the
/// scheduler converges state by polling the store regardless of bus
/// delivery.
#[derive(Clone, Default)]
pub struct MemoryEventBus {
    state: Arc<Mutex<BusState>>,
}

impl MemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, subject: &str, body: Vec<u8>) -> Result<()> {
        let targets: Vec<Arc<GroupShared>> = {
            let state = self.state.lock();
            state
                .routes
                .get(subject)
                .map(|groups| {
                    groups
                        .iter()
                        .filter_map(|name| state.groups.get(name).cloned())
                        .collect()
                })
                .unwrap_or_default()
        };
        for group in targets {
            group.queue.lock().push_back(Delivery {
                subject: subject.to_owned(),
                body: body.clone(),
                deliveries: 1,
            });
            group.notify.notify_one();
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        subjects: &[&str],
        group: &str,
    ) -> Result<Box<dyn Subscription>> {
        let shared = {
            let mut state = self.state.lock();
            let shared = state
                .groups
                .entry(group.to_owned())
                .or_insert_with(|| {
                    Arc::new(GroupShared {
                        queue: Mutex::new(VecDeque::new()),
                        notify: Notify::new(),
                    })
                })
                .clone();
            for subject in subjects {
                let entry = state.routes.entry((*subject).to_owned()).or_default();
                if !entry.iter().any(|name| name == group) {
                    entry.push(group.to_owned());
                }
            }
            shared
        };
        Ok(Box::new(MemorySubscription { group: shared }))
    }
}

struct MemorySubscription {
    group: Arc<GroupShared>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Delivery {
        loop {
            if let Some(delivery) = self.group.queue.lock().pop_front() {
                return delivery;
            }
            self.group.notify.notified().await;
        }
    }

    async fn ack(&mut self, _delivery: Delivery) -> Result<()> {
        Ok(())
    }

    async fn nack(&mut self, mut delivery: Delivery) -> Result<()> {
        delivery.deliveries += 1;
        self.group.queue.lock().push_front(delivery);
        self.group.notify.notify_one();
        Ok(())
    }
}

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use futures_util::future::join_all;
use herald_common::{Capability, MessageId, internal};

use super::{Channel, ChannelConfig, Transport};
use crate::{
    error::{DeliveryError, RegistryError},
    recovery::{RecoveryPolicy, StandardRecoveryPolicy},
    types::ChannelName,
};

/// Every channel known to the engine, and which capability routes to which
/// chain
#[derive(Debug, Clone, Default)]
pub struct ChannelRegistry {
    channels: AHashMap<ChannelName, Arc<Channel>>,
    routes: AHashMap<Capability, ChannelName>,
}

impl ChannelRegistry {
    #[must_use]
    pub fn builder() -> ChannelRegistryBuilder {
        ChannelRegistryBuilder::default()
    }

    #[must_use]
    pub fn get(&self, name: &ChannelName) -> Option<&Arc<Channel>> {
        self.channels.get(name)
    }

    pub fn channels(&self) -> impl Iterator<Item = &Arc<Channel>> {
        self.channels.values()
    }

    /// The first enabled channel along the chain routed for `capability`
    #[must_use]
    pub fn resolve(&self, capability: &Capability) -> Option<Arc<Channel>> {
        let head = self.routes.get(capability)?;
        Self::next_enabled(self.channels.get(head))
    }

    /// The first enabled channel starting at `start` and following fallbacks
    #[must_use]
    pub fn next_enabled(start: Option<&Arc<Channel>>) -> Option<Arc<Channel>> {
        let mut current = start;
        while let Some(channel) = current {
            if channel.is_enabled() {
                return Some(Arc::clone(channel));
            }
            current = channel.fallback();
        }
        None
    }

    /// Drop retry bookkeeping for `message` in every channel's policy
    pub fn forget(&self, message: &MessageId) {
        for channel in self.channels.values() {
            channel.recovery_policy().forget(message);
        }
    }

    /// Initialise every enabled channel up front.
    ///
    /// # Errors
    /// The first error reported by a transport. Every channel is attempted
    /// regardless.
    pub async fn init_all(&self) -> Result<(), DeliveryError> {
        let results = join_all(
            self.channels
                .values()
                .filter(|channel| channel.is_enabled())
                .map(|channel| channel.init()),
        )
        .await;

        results.into_iter().collect()
    }
}

/// Assembles a [`ChannelRegistry`] from channel configurations
///
/// `build` checks that every fallback, policy and route refers to something
/// that exists, and that no fallback chain loops.
#[derive(Default)]
pub struct ChannelRegistryBuilder {
    channels: Vec<(ChannelConfig, Option<Arc<dyn Transport>>)>,
    policies: AHashMap<String, Arc<dyn RecoveryPolicy>>,
    routes: Vec<(Capability, ChannelName)>,
}

impl ChannelRegistryBuilder {
    #[must_use]
    pub fn channel(mut self, config: ChannelConfig, transport: Arc<dyn Transport>) -> Self {
        self.channels.push((config, Some(transport)));
        self
    }

    /// Add a channel whose transport is provided by `transports`, keyed by
    /// channel name.
    #[must_use]
    pub fn channels(
        mut self,
        configs: impl IntoIterator<Item = ChannelConfig>,
        transports: &AHashMap<ChannelName, Arc<dyn Transport>>,
    ) -> Self {
        for config in configs {
            let transport = transports.get(&config.name).cloned();
            self.channels.push((config, transport));
        }
        self
    }

    /// Register a custom policy that channels can name in their config.
    #[must_use]
    pub fn policy(mut self, name: impl Into<String>, policy: Arc<dyn RecoveryPolicy>) -> Self {
        self.policies.insert(name.into(), policy);
        self
    }

    #[must_use]
    pub fn route(mut self, capability: impl Into<Capability>, channel: impl Into<ChannelName>) -> Self {
        self.routes.push((capability.into(), channel.into()));
        self
    }

    #[must_use]
    pub fn routes(mut self, routes: impl IntoIterator<Item = (Capability, ChannelName)>) -> Self {
        self.routes.extend(routes);
        self
    }

    /// # Errors
    /// A [`RegistryError`] describing the first inconsistency found.
    pub fn build(self) -> Result<ChannelRegistry, RegistryError> {
        let mut configs: AHashMap<ChannelName, (ChannelConfig, Arc<dyn Transport>)> =
            AHashMap::with_capacity(self.channels.len());

        for (config, transport) in self.channels {
            if config.steps.is_empty() {
                return Err(RegistryError::EmptyPlan(config.name));
            }
            let Some(transport) = transport else {
                return Err(RegistryError::MissingTransport(config.name));
            };
            if configs.contains_key(&config.name) {
                return Err(RegistryError::DuplicateChannel(config.name));
            }
            configs.insert(config.name.clone(), (config, transport));
        }

        for (config, _) in configs.values() {
            if let Some(fallback) = &config.fallback
                && !configs.contains_key(fallback)
            {
                return Err(RegistryError::UnknownChannel {
                    referenced_by: config.name.to_string(),
                    name: fallback.clone(),
                });
            }
            if let Some(policy) = &config.policy
                && !self.policies.contains_key(policy)
            {
                return Err(RegistryError::UnknownPolicy {
                    channel: config.name.clone(),
                    policy: policy.clone(),
                });
            }
            Self::check_acyclic(&config.name, &configs)?;
        }

        let mut routes = AHashMap::with_capacity(self.routes.len());
        for (capability, channel) in self.routes {
            if !configs.contains_key(&channel) {
                return Err(RegistryError::UnknownChannel {
                    referenced_by: format!("route {capability}"),
                    name: channel,
                });
            }
            routes.insert(capability, channel);
        }

        let names: Vec<_> = configs.keys().cloned().collect();
        let mut channels = AHashMap::with_capacity(names.len());
        for name in names {
            Self::assemble(&name, &mut configs, &self.policies, &mut channels);
        }

        internal!(
            level = INFO,
            "Registered {} channels and {} routes",
            channels.len(),
            routes.len()
        );

        Ok(ChannelRegistry { channels, routes })
    }

    fn check_acyclic(
        start: &ChannelName,
        configs: &AHashMap<ChannelName, (ChannelConfig, Arc<dyn Transport>)>,
    ) -> Result<(), RegistryError> {
        let mut seen = AHashSet::new();
        let mut current = Some(start);
        while let Some(name) = current {
            if !seen.insert(name) {
                return Err(RegistryError::FallbackCycle(start.clone()));
            }
            current = configs
                .get(name)
                .and_then(|(config, _)| config.fallback.as_ref());
        }
        Ok(())
    }

    /// Build `name` after its fallback chain. Chains are known to be acyclic
    /// and complete at this point.
    fn assemble(
        name: &ChannelName,
        configs: &mut AHashMap<ChannelName, (ChannelConfig, Arc<dyn Transport>)>,
        policies: &AHashMap<String, Arc<dyn RecoveryPolicy>>,
        channels: &mut AHashMap<ChannelName, Arc<Channel>>,
    ) -> Option<Arc<Channel>> {
        if let Some(channel) = channels.get(name) {
            return Some(Arc::clone(channel));
        }

        let (config, transport) = configs.remove(name)?;
        let fallback = config
            .fallback
            .as_ref()
            .and_then(|fallback| Self::assemble(fallback, configs, policies, channels));

        let policy: Arc<dyn RecoveryPolicy> =
            match config.policy.as_ref().and_then(|policy| policies.get(policy)) {
                Some(policy) => Arc::clone(policy),
                None => Arc::new(StandardRecoveryPolicy::new(config.recovery.clone())),
            };

        let channel = Arc::new(Channel::new(config, fallback, policy, transport));
        channels.insert(name.clone(), Arc::clone(&channel));
        Some(channel)
    }
}

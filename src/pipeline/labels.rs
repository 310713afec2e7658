//! Per-job label resolution.
//!
//! A `LabelResolver` lives for one job. On first use it lists the mailbox's
//! labels, creates any classification label that is missing, and caches the
//! name → label map. A `Conflict` on create means someone else created it
//! first; the resolver re-lists instead of failing.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::ProviderError;
use crate::pipeline::types::{ClassLabel, Label, MessageEnvelope};
use crate::providers::MailProvider;

pub struct LabelResolver {
    provider: Arc<dyn MailProvider>,
    cache: Option<HashMap<String, Label>>,
}

impl LabelResolver {
    pub fn new(provider: Arc<dyn MailProvider>) -> Self {
        Self {
            provider,
            cache: None,
        }
    }

    async fn list_by_name(&self) -> Result<HashMap<String, Label>, ProviderError> {
        let labels = self.provider.list_labels().await?;
        Ok(labels.into_iter().map(|l| (l.name.clone(), l)).collect())
    }

    /// Make sure all classification labels exist. Idempotent.
    pub async fn ensure_all(&mut self) -> Result<(), ProviderError> {
        if self.cache.is_some() {
            return Ok(());
        }

        let mut by_name = self.list_by_name().await?;
        for class in ClassLabel::ALL {
            let name = class.name();
            if by_name.contains_key(name) {
                continue;
            }
            match self.provider.create_label(name).await {
                Ok(label) => {
                    info!(label = name, id = %label.id, "Created classification label");
                    by_name.insert(name.to_string(), label);
                }
                Err(ProviderError::Conflict { .. }) => {
                    debug!(label = name, "Label created concurrently, re-listing");
                    let refreshed = self.list_by_name().await?;
                    if !refreshed.contains_key(name) {
                        warn!(label = name, "Label conflict but label not listed");
                    }
                    by_name.extend(refreshed);
                }
                Err(e) => return Err(e),
            }
        }

        self.cache = Some(by_name);
        Ok(())
    }

    /// Label for a classification, falling back to the provider default.
    pub async fn resolve(&mut self, class: ClassLabel) -> Result<Option<Label>, ProviderError> {
        self.ensure_all().await?;
        let found = self
            .cache
            .as_ref()
            .and_then(|cache| cache.get(class.name()))
            .cloned();
        if found.is_none() {
            warn!(label = class.name(), "Classification label unavailable, using default");
        }
        Ok(found.or_else(|| self.provider.default_label()))
    }

    /// Whether the message already carries a classification label.
    ///
    /// Matches on id (Gmail) or name (Outlook categories).
    pub async fn already_labeled(&mut self, message: &MessageEnvelope) -> Result<bool, ProviderError> {
        self.ensure_all().await?;
        let Some(cache) = self.cache.as_ref() else {
            return Ok(false);
        };
        Ok(ClassLabel::ALL
            .iter()
            .filter_map(|class| cache.get(class.name()))
            .any(|label| {
                message
                    .labels
                    .iter()
                    .any(|l| l == &label.id || l == &label.name)
            }))
    }
}

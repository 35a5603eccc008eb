//! Mapping version resolution
//!
//! A submission's own JSON carries the tag of the form version it was
//! collected with. The resolver turns that tag into the mapping versions
//! describing how the submission is exported.

use crate::adapters::database::traits::MappingRepository;
use crate::domain::{FormId, Instance, MappingError, MappingVersion, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Resolves submissions to mapping versions, caching per form and version tag
///
/// The cache lives as long as the resolver; create one per export run.
pub struct MappingResolver<'a> {
    repository: &'a dyn MappingRepository,
    cache: HashMap<(FormId, String), Vec<Arc<MappingVersion>>>,
}

impl<'a> MappingResolver<'a> {
    pub fn new(repository: &'a dyn MappingRepository) -> Self {
        Self {
            repository,
            cache: HashMap::new(),
        }
    }

    /// Mapping versions applying to `instance`, in repository order
    ///
    /// # Errors
    ///
    /// - [`MappingError::MissingVersionTag`] when the submission has no version tag
    /// - [`MappingError::NoMappingForVersion`] when no mapping version matches
    pub async fn resolve(&mut self, instance: &Instance) -> Result<Vec<Arc<MappingVersion>>> {
        let version = instance
            .version_tag()
            .ok_or(MappingError::MissingVersionTag {
                instance_id: instance.id,
            })?;

        let key = (instance.form_id, version);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.clone());
        }

        let matching: Vec<Arc<MappingVersion>> = self
            .repository
            .mapping_versions_for_form(instance.form_id)
            .await?
            .into_iter()
            .filter(|mv| mv.form_version == key.1)
            .collect();

        if matching.is_empty() {
            return Err(MappingError::NoMappingForVersion {
                form_id: instance.form_id,
                version: key.1,
            }
            .into());
        }

        tracing::debug!(
            form_id = %instance.form_id,
            version = %key.1,
            mapping_versions = matching.len(),
            "Resolved mapping versions"
        );
        self.cache.insert(key, matching.clone());
        Ok(matching)
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        AccountId, IasoError, InstanceBuilder, InstanceId, MappingDefinition, MappingType,
        MappingVersionId,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRepository {
        versions: Vec<Arc<MappingVersion>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MappingRepository for CountingRepository {
        async fn mapping_versions_for_form(
            &self,
            form_id: FormId,
        ) -> Result<Vec<Arc<MappingVersion>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .versions
                .iter()
                .filter(|mv| mv.form_id == form_id)
                .cloned()
                .collect())
        }
    }

    fn version(id: i64, mapping_type: MappingType, tag: &str) -> Arc<MappingVersion> {
        Arc::new(MappingVersion {
            id: MappingVersionId::new(id),
            name: format!("mapping {id}"),
            mapping_type,
            form_id: FormId::new(1),
            form_version: tag.to_string(),
            repeat_groups: vec![],
            definition: MappingDefinition::default(),
            credentials: None,
        })
    }

    fn repository() -> CountingRepository {
        CountingRepository {
            versions: vec![
                version(1, MappingType::Aggregate, "2023010101"),
                version(2, MappingType::Event, "2023010101"),
                version(3, MappingType::Aggregate, "2023020202"),
            ],
            calls: AtomicUsize::new(0),
        }
    }

    fn instance(id: i64, answers: serde_json::Value) -> Instance {
        InstanceBuilder::new()
            .id(InstanceId::new(id))
            .account_id(AccountId::new(1))
            .form_id(FormId::new(1))
            .json(answers)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_resolves_all_matching_versions_and_caches() {
        let repository = repository();
        let mut resolver = MappingResolver::new(&repository);

        let first = resolver
            .resolve(&instance(1, json!({"_version": "2023010101"})))
            .await
            .unwrap();
        let ids: Vec<i64> = first.iter().map(|mv| mv.id.value()).collect();
        assert_eq!(ids, vec![1, 2]);

        resolver
            .resolve(&instance(2, json!({"version": 2023010101})))
            .await
            .unwrap();
        assert_eq!(repository.calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.cached_entries(), 1);
    }

    #[tokio::test]
    async fn test_missing_version_tag() {
        let repository = repository();
        let mut resolver = MappingResolver::new(&repository);
        let err = resolver
            .resolve(&instance(5, json!({"age": 3})))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IasoError::Mapping(MappingError::MissingVersionTag { instance_id }) if instance_id.value() == 5
        ));
    }

    #[tokio::test]
    async fn test_no_mapping_for_version() {
        let repository = repository();
        let mut resolver = MappingResolver::new(&repository);
        let err = resolver
            .resolve(&instance(1, json!({"_version": "1999"})))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IasoError::Mapping(MappingError::NoMappingForVersion { ref version, .. }) if version == "1999"
        ));
        assert!(err.is_request_validation_error());
    }
}

//! Convergence waits composed over the Provider seam
//!
//! Resource glue that exposes its lifecycle through the `status` attribute
//! of [`State`] can wait on a resource without writing its own refresh
//! closure.

use pyxis_core::provider::Provider;
use pyxis_core::resource::{ResourceId, State};

use crate::state::{Refresh, WaitConf, WaitError};

/// Poll `provider.read` until the resource's `status` attribute reaches one
/// of the descriptor's target states.
///
/// A readable resource without a `status` attribute is reported as an
/// unexpected empty status, surfacing descriptor/resource mismatches
/// instead of looping forever.
pub async fn wait_resource(
    conf: &WaitConf,
    provider: &dyn Provider,
    id: &ResourceId,
    identifier: Option<&str>,
) -> Result<Option<State>, WaitError> {
    let refresh = move || {
        let read = provider.read(id, identifier);
        async move {
            let state = read.await?;
            Ok(observe(state))
        }
    };
    conf.wait_for_state(refresh).await
}

/// Wait until the resource is gone, treating not-found as the target.
///
/// Statuses observed on the way down (e.g. "deleting") belong in the
/// descriptor's pending set.
pub async fn wait_resource_deleted(
    conf: WaitConf,
    provider: &dyn Provider,
    id: &ResourceId,
    identifier: Option<&str>,
) -> Result<(), WaitError> {
    let conf = conf.missing_is_target(true);
    wait_resource(&conf, provider, id, identifier)
        .await
        .map(|_| ())
}

fn observe(state: State) -> Refresh<State> {
    if !state.exists {
        return Refresh::Missing;
    }
    let status = state.status().unwrap_or_default().to_string();
    let detail = state.status_detail().map(str::to_string);
    Refresh::Found {
        status,
        detail,
        payload: state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use pyxis_core::provider::{BoxFuture, ProviderResult};
    use pyxis_core::resource::{Resource, Value};

    // Provider whose reads replay a scripted status sequence.
    struct ScriptedProvider {
        statuses: Mutex<Vec<Option<&'static str>>>,
        reads: Arc<Mutex<usize>>,
    }

    impl ScriptedProvider {
        fn new(statuses: Vec<Option<&'static str>>) -> Self {
            Self {
                statuses: Mutex::new(statuses),
                reads: Arc::new(Mutex::new(0)),
            }
        }

        fn next_status(&self) -> Option<&'static str> {
            let mut statuses = self.statuses.lock().unwrap();
            *self.reads.lock().unwrap() += 1;
            if statuses.len() > 1 {
                statuses.remove(0)
            } else {
                statuses[0]
            }
        }
    }

    impl Provider for ScriptedProvider {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn read(
            &self,
            id: &ResourceId,
            identifier: Option<&str>,
        ) -> BoxFuture<'_, ProviderResult<State>> {
            let id = id.clone();
            let identifier = identifier.map(str::to_string);
            let status = self.next_status();
            Box::pin(async move {
                match status {
                    None => Ok(State::not_found(id)),
                    Some(status) => {
                        let mut attrs = HashMap::new();
                        attrs.insert("status".to_string(), Value::String(status.to_string()));
                        let mut state = State::existing(id, attrs);
                        if let Some(identifier) = identifier {
                            state = state.with_identifier(identifier);
                        }
                        Ok(state)
                    }
                }
            })
        }

        fn create(&self, _resource: &Resource) -> BoxFuture<'_, ProviderResult<State>> {
            unimplemented!("not exercised")
        }

        fn update(
            &self,
            _id: &ResourceId,
            _identifier: &str,
            _to: &Resource,
        ) -> BoxFuture<'_, ProviderResult<State>> {
            unimplemented!("not exercised")
        }

        fn delete(&self, _id: &ResourceId, _identifier: &str) -> BoxFuture<'_, ProviderResult<()>> {
            unimplemented!("not exercised")
        }
    }

    fn conf() -> WaitConf {
        WaitConf::new("database_instance.primary", Duration::from_secs(300))
            .pending(["creating", "deleting"])
            .target(["available"])
            .poll_interval(Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_available_status() {
        let provider = ScriptedProvider::new(vec![
            Some("creating"),
            Some("creating"),
            Some("available"),
        ]);
        let id = ResourceId::new("database_instance", "primary");

        let state = wait_resource(&conf(), &provider, &id, Some("db-123"))
            .await
            .unwrap()
            .expect("payload for reached target");

        assert_eq!(state.status(), Some("available"));
        assert_eq!(state.identifier, Some("db-123".to_string()));
        assert_eq!(*provider.reads.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_wait_treats_not_found_as_success() {
        let provider = ScriptedProvider::new(vec![Some("deleting"), Some("deleting"), None]);
        let id = ResourceId::new("database_instance", "primary");

        wait_resource_deleted(conf(), &provider, &id, Some("db-123"))
            .await
            .unwrap();
        assert_eq!(*provider.reads.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn resource_without_status_attribute_is_unexpected() {
        struct NoStatus;
        impl Provider for NoStatus {
            fn name(&self) -> &'static str {
                "no-status"
            }
            fn read(
                &self,
                id: &ResourceId,
                _identifier: Option<&str>,
            ) -> BoxFuture<'_, ProviderResult<State>> {
                let id = id.clone();
                Box::pin(async move { Ok(State::existing(id, HashMap::new())) })
            }
            fn create(&self, _resource: &Resource) -> BoxFuture<'_, ProviderResult<State>> {
                unimplemented!()
            }
            fn update(
                &self,
                _id: &ResourceId,
                _identifier: &str,
                _to: &Resource,
            ) -> BoxFuture<'_, ProviderResult<State>> {
                unimplemented!()
            }
            fn delete(
                &self,
                _id: &ResourceId,
                _identifier: &str,
            ) -> BoxFuture<'_, ProviderResult<()>> {
                unimplemented!()
            }
        }

        let id = ResourceId::new("database_instance", "primary");
        let err = wait_resource(&conf(), &NoStatus, &id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, WaitError::UnexpectedStatus { status, .. } if status.is_empty()));
    }
}

//! Reconciler keeps each role's routing table in step with the cluster's webhook configurations.

use std::{collections::BTreeSet, fmt::Debug, time::Duration};

use k8s_openapi::{
    ClusterResourceScope,
    api::admissionregistration::v1::{
        MutatingWebhookConfiguration, ValidatingWebhookConfiguration, WebhookClientConfig,
    },
};
use kube::runtime::{
    controller::Error as CtrlErr,
    reflector::{self, store::Writer},
};
use serde::de::DeserializeOwned;
use tokio::signal::unix::{SignalKind, signal};
use tokio_stream::wrappers::SignalStream;

use crate::{delegate, metrics, prelude::*, table::RoutingTable};

const RETRY_DELAY: Duration = Duration::from_secs(30);

/// WebhookSet is a cluster object declaring a list of webhooks for one role.
pub trait WebhookSet:
    Resource<DynamicType = (), Scope = ClusterResourceScope>
    + Clone
    + DeserializeOwned
    + Debug
    + Send
    + Sync
    + 'static
{
    /// Role whose routing table the object's hooks go into.
    const ROLE: Role;

    /// Hooks lists the declared webhooks as (name, client config) pairs.
    fn hooks(&self) -> Vec<(&str, &WebhookClientConfig)>;
}

impl WebhookSet for MutatingWebhookConfiguration {
    const ROLE: Role = Role::Mutating;

    fn hooks(&self) -> Vec<(&str, &WebhookClientConfig)> {
        self.webhooks
            .iter()
            .flatten()
            .map(|w| (w.name.as_str(), &w.client_config))
            .collect()
    }
}

impl WebhookSet for ValidatingWebhookConfiguration {
    const ROLE: Role = Role::Validating;

    fn hooks(&self) -> Vec<(&str, &WebhookClientConfig)> {
        self.webhooks
            .iter()
            .flatten()
            .map(|w| (w.name.as_str(), &w.client_config))
            .collect()
    }
}

/// Apply runs one reconciliation pass for the configuration object `object`.
///
/// Each hook is resolved and installed in declaration order. The first hook that fails to
/// resolve fails the whole pass; hooks installed before it stay installed. Once every hook has
/// been installed, hooks the object no longer declares are released.
///
/// Returns the number of hooks installed.
pub fn apply<'a, I>(table: &RoutingTable, object: &str, hooks: I) -> Result<usize>
where
    I: IntoIterator<Item = (&'a str, &'a WebhookClientConfig)>,
{
    let mut declared = BTreeSet::new();
    for (hook, cfg) in hooks {
        let d = delegate::resolve(cfg).map_err(|err| Error::Hook {
            hook: hook.to_string(),
            source: Box::new(err),
        })?;
        info!(object, hook, endpoint = d.endpoint(), "added delegate");
        table.insert(object, hook, d);
        declared.insert(hook.to_string());
    }
    for hook in table.release(object, &declared) {
        info!(object, %hook, "released delegate");
    }
    Ok(declared.len())
}

/// Install runs [`apply`] for `obj` unless the object has already been deleted.
///
/// Returns `None` if the object was skipped.
pub fn install<K: WebhookSet>(table: &RoutingTable, obj: &K) -> Result<Option<usize>> {
    let object = obj.name_any();
    if obj.uid().is_some_and(|uid| table.is_retired(&object, &uid)) {
        debug!(object, "object already deleted, not installing");
        return Ok(None);
    }
    apply(table, &object, obj.hooks()).map(Some)
}

/// Triggers turns a watch stream into the objects to reconcile.
///
/// Each event is applied to `writer`'s store before the [`Evictor`] sees it, so once a deletion
/// has evicted an object's hooks, a reconcile for that object finds nothing in the store.
pub fn triggers<K, S>(
    events: S,
    writer: Writer<K>,
    table: Arc<RoutingTable>,
) -> impl Stream<Item = Result<K, watcher::Error>> + Send + 'static
where
    K: WebhookSet,
    S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send + 'static,
{
    let mut evictor = Evictor::new(table);
    events
        .reflect(writer)
        .inspect_ok(move |ev| evictor.observe(ev))
        .applied_objects()
}

/// Controller is the webhook configuration controller for `K`'s role.
///
/// One watch feeds both the controller's cache and the role's [`Evictor`].
/// Sending the process SIGUSR1 reconciles every object again.
///
/// An error is returned if any setup fails.
#[instrument(skip_all, fields(role = %K::ROLE))]
pub fn controller<K: WebhookSet>(
    cancel: CancellationToken,
    ctx: Arc<Context>,
) -> Result<ControllerFuture> {
    let sig = SignalStream::new(signal(SignalKind::user_defined1())?);
    let table = ctx.table(K::ROLE).clone();
    let (reader, writer) = reflector::store();
    let events = watcher(Api::<K>::all(ctx.client.clone()), watcher::Config::default())
        .default_backoff();
    let ctl = Controller::for_stream(triggers(events, writer, table.clone()), reader)
        .reconcile_all_on(sig)
        .graceful_shutdown_on(cancel.cancelled_owned());

    Ok(async move {
        info!(role = %K::ROLE, "spawning webhook configuration controller");
        ctl.run(reconcile::<K>, handle_error::<K>, ctx)
            .for_each(|ret| {
                match ret {
                    Ok(_) => (),
                    Err(CtrlErr::ObjectNotFound(objref)) => {
                        // Deleted between being queued and being reconciled.
                        debug!(%objref, "object not found");
                        for hook in table.remove_owner(&objref.name) {
                            info!(object = %objref.name, %hook, "released delegate");
                        }
                    }
                    Err(CtrlErr::ReconcilerFailed(error, objref)) => {
                        error!(%objref, %error, "reconcile error")
                    }
                    Err(error) => error!(%error, "controller error"),
                };
                future::ready(())
            })
            .await;
        debug!(role = %K::ROLE, "webhook configuration controller finished");
        Ok(())
    }
    .boxed())
}

#[instrument(skip_all, fields(object = %obj.name_any()))]
async fn reconcile<K: WebhookSet>(obj: Arc<K>, ctx: Arc<Context>) -> Result<Action> {
    trace!("start");
    metrics::reconciled(K::ROLE);
    match install(ctx.table(K::ROLE), obj.as_ref())? {
        Some(n) => debug!(hooks = n, "reconciled"),
        None => debug!("skipped deleted object"),
    }
    Ok(Action::await_change())
}

fn handle_error<K: WebhookSet>(obj: Arc<K>, err: &Error, _ctx: Arc<Context>) -> Action {
    metrics::reconcile_failed(K::ROLE);
    error!(object = %obj.name_any(), error = %err, "failed to add delegate");
    Action::requeue(RETRY_DELAY)
}

/// Evictor withdraws the hooks of deleted configuration objects from a routing table.
pub struct Evictor {
    table: Arc<RoutingTable>,
    // Objects seen during a re-list, if one is in progress.
    relist: Option<BTreeSet<String>>,
}

impl Evictor {
    pub fn new(table: Arc<RoutingTable>) -> Self {
        Self {
            table,
            relist: None,
        }
    }

    /// Observe handles one watch event.
    ///
    /// A `Delete` releases the object's hooks and retires its UID. A completed re-list releases
    /// the hooks of every object that was not re-listed, catching deletes missed while the watch
    /// was down.
    pub fn observe<K: WebhookSet>(&mut self, event: &watcher::Event<K>) {
        let evicted = match event {
            watcher::Event::Delete(obj) => {
                let name = obj.name_any();
                match obj.uid() {
                    Some(uid) => self.table.retire(&name, &uid),
                    None => self.table.remove_owner(&name),
                }
            }
            watcher::Event::Init => {
                self.relist = Some(BTreeSet::new());
                return;
            }
            watcher::Event::InitApply(obj) => {
                if let Some(seen) = self.relist.as_mut() {
                    seen.insert(obj.name_any());
                }
                return;
            }
            watcher::Event::InitDone => match self.relist.take() {
                Some(seen) => self.table.retain_owners(&seen),
                None => return,
            },
            watcher::Event::Apply(_) => return,
        };
        for hook in evicted {
            info!(role = %K::ROLE, %hook, "evicted delegate");
        }
    }
}

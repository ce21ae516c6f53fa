//! Wiring of watches, caches, work queues and the tunnel-config endpoint.

use std::{fmt::Debug, future::Future, mem, sync::Arc, time::Duration};

use futures::StreamExt;
use k8s_openapi::api::{
    core::v1::{Namespace, Node, Service},
    networking::v1::Ingress,
};
use kube::{
    Api, Client, Resource,
    runtime::{
        WatchStreamExt,
        reflector::{self, ObjectRef, Store, store::Writer},
        watcher::{self, Event, watcher},
    },
};
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, interval_at},
};

use crate::{
    Error, Outcome, Result,
    config::Config,
    filters::{
        Admission, Change, admit_ingress, admit_namespace, admit_node, ingresses_in, tenant_namespaces,
    },
    ports::PortAllocator,
    queue::WorkQueue,
    reconcile::{ReconcileContext, reconcile_ingress, reconcile_namespace, reconcile_node, with_timeout},
    render::RenderSettings,
    server::{self, ServerState},
    store::{ClusterStore, KubeStore},
};

/// Receives the changes observed on one watched kind.
pub trait Dispatch<K> {
    fn dispatch(&self, change: Change<'_, K>);
}

/// The reflector caches of every watched kind.
#[derive(Clone)]
pub struct Caches {
    pub ingresses: Store<Ingress>,
    pub namespaces: Store<Namespace>,
    pub nodes: Store<Node>,
    pub services: Store<Service>,
}

impl Caches {
    /// Resolves once every cache has completed its initial listing.
    pub async fn ready(&self) -> Result<()> {
        let dropped = |e: reflector::store::WriterDropped| Error::UnexpectedError(format!("cache writer dropped: {e}"));
        self.ingresses.wait_until_ready().await.map_err(dropped)?;
        self.namespaces.wait_until_ready().await.map_err(dropped)?;
        self.nodes.wait_until_ready().await.map_err(dropped)?;
        self.services.wait_until_ready().await.map_err(dropped)?;
        Ok(())
    }
}

///
/// Routes admitted changes into the work queues. Besides the object's own key:
///
/// * an admitted namespace also enqueues its Ingresses,
/// * a deleted service of the system namespace enqueues every tenant namespace.
///
#[derive(Clone)]
pub struct Routes {
    pub ingress_queue: WorkQueue,
    pub namespace_queue: WorkQueue,
    pub node_queue: WorkQueue,
    pub ingresses: Store<Ingress>,
    pub namespaces: Store<Namespace>,
}

impl Dispatch<Ingress> for Routes {
    fn dispatch(&self, change: Change<'_, Ingress>) {
        if let Admission::Enqueue(key) = admit_ingress(change) {
            self.ingress_queue.add(key);
        }
    }
}

impl Dispatch<Namespace> for Routes {
    fn dispatch(&self, change: Change<'_, Namespace>) {
        if let Admission::Enqueue(key) = admit_namespace(change) {
            let ingresses = self.ingresses.state();
            for ingress in ingresses_in(&key, ingresses.iter().map(|ingress| &**ingress)) {
                self.ingress_queue.add(ingress);
            }
            self.namespace_queue.add(key);
        }
    }
}

impl Dispatch<Node> for Routes {
    fn dispatch(&self, change: Change<'_, Node>) {
        if let Admission::Enqueue(key) = admit_node(change) {
            self.node_queue.add(key);
        }
    }
}

impl Dispatch<Service> for Routes {
    fn dispatch(&self, change: Change<'_, Service>) {
        if change.is_deletion() {
            let namespaces = self.namespaces.state();
            for key in tenant_namespaces(namespaces.iter().map(|namespace| &**namespace)) {
                self.namespace_queue.add(key);
            }
        }
    }
}

///
/// Applies watch events to a reflector cache and dispatches the resulting changes.
///
/// Objects of a relist only become visible in the cache once the relist is done, so their changes
/// are held back until then. The previous version of an object is read from the cache before an
/// event replaces it.
///
pub struct Reflect<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    writer: Writer<K>,
    reader: Store<K>,
    relisted: Vec<(Option<Arc<K>>, K)>,
}

impl<K> Reflect<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    pub fn new(writer: Writer<K>) -> Self {
        let reader = writer.as_reader();
        Self {
            writer,
            reader,
            relisted: Vec::new(),
        }
    }

    pub fn apply(&mut self, event: Event<K>, target: &impl Dispatch<K>) {
        match &event {
            Event::Apply(obj) => {
                let previous = self.reader.get(&ObjectRef::from_obj(obj));
                self.writer.apply_watcher_event(&event);
                dispatch_applied(target, previous.as_deref(), obj);
            }
            Event::Delete(obj) => {
                self.writer.apply_watcher_event(&event);
                target.dispatch(Change::Deleted(obj));
            }
            Event::Init => {
                self.relisted.clear();
                self.writer.apply_watcher_event(&event);
            }
            Event::InitApply(obj) => {
                let previous = self.reader.get(&ObjectRef::from_obj(obj));
                self.writer.apply_watcher_event(&event);
                self.relisted.push((previous, obj.clone()));
            }
            Event::InitDone => {
                self.writer.apply_watcher_event(&event);
                for (previous, obj) in mem::take(&mut self.relisted) {
                    dispatch_applied(target, previous.as_deref(), &obj);
                }
            }
        }
    }
}

fn dispatch_applied<K>(target: &impl Dispatch<K>, previous: Option<&K>, obj: &K) {
    match previous {
        Some(old) => target.dispatch(Change::Updated { old, new: obj }),
        None => target.dispatch(Change::Added(obj)),
    }
}

/// Delivers every cached object as an update onto itself.
pub fn resync<K>(cache: &Store<K>, target: &impl Dispatch<K>)
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    for obj in cache.state() {
        target.dispatch(Change::Updated { old: &obj, new: &obj });
    }
}

async fn drive<K>(kind: &'static str, api: Api<K>, writer: Writer<K>, routes: Routes)
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    Routes: Dispatch<K>,
{
    let mut reflect = Reflect::new(writer);
    let mut events = watcher(api, watcher::Config::default()).default_backoff().boxed();
    while let Some(event) = events.next().await {
        match event {
            Ok(Event::InitDone) => {
                debug!("Listed all {kind}");
                reflect.apply(Event::InitDone, &routes);
            }
            Ok(event) => reflect.apply(event, &routes),
            Err(e) => warn!("Watch of {kind} failed: {e}"),
        }
    }
    warn!("Watch of {kind} ended");
}

async fn resync_every(period: Duration, caches: Caches, routes: Routes) {
    let mut ticks = interval_at(Instant::now() + period, period);
    loop {
        ticks.tick().await;
        debug!("Resyncing cached objects");
        resync(&caches.ingresses, &routes);
        resync(&caches.namespaces, &routes);
        resync(&caches.nodes, &routes);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn spawn_pool<F, Fut>(queue: &WorkQueue, workers: usize, reconcile: F) -> JoinHandle<()>
where
    F: Fn(String) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome>> + Send + 'static,
{
    let queue = queue.clone();
    tokio::spawn(async move { queue.run(workers, reconcile).await })
}

///
/// Runs the controller until SIGINT or SIGTERM.
///
/// Work only starts once the caches of every watched kind are filled. On shutdown the watches are
/// stopped, the queues drain their in-flight keys and the endpoint finishes open requests.
///
pub async fn run(config: Config) -> Result<()> {
    let client = Client::try_default().await?;

    let (ingresses, ingress_writer) = reflector::store::<Ingress>();
    let (namespaces, namespace_writer) = reflector::store::<Namespace>();
    let (nodes, node_writer) = reflector::store::<Node>();
    let (services, service_writer) = reflector::store::<Service>();
    let caches = Caches {
        ingresses,
        namespaces,
        nodes,
        services,
    };

    let store: Arc<dyn ClusterStore> = Arc::new(KubeStore::new(
        client.clone(),
        caches.ingresses.clone(),
        caches.namespaces.clone(),
        caches.nodes.clone(),
        caches.services.clone(),
    ));

    let routes = Routes {
        ingress_queue: WorkQueue::new("ingress"),
        namespace_queue: WorkQueue::new("namespace"),
        node_queue: WorkQueue::new("node"),
        ingresses: caches.ingresses.clone(),
        namespaces: caches.namespaces.clone(),
    };

    let ingress_api = match &config.watch_namespace {
        Some(namespace) => Api::<Ingress>::namespaced(client.clone(), namespace),
        None => Api::<Ingress>::all(client.clone()),
    };
    let service_api = Api::<Service>::namespaced(client.clone(), &config.system_namespace);
    let mut watches = vec![
        tokio::spawn(drive("ingresses", ingress_api, ingress_writer, routes.clone())),
        tokio::spawn(drive("namespaces", Api::all(client.clone()), namespace_writer, routes.clone())),
        tokio::spawn(drive("nodes", Api::all(client.clone()), node_writer, routes.clone())),
        tokio::spawn(drive("services", service_api, service_writer, routes.clone())),
    ];

    info!("Waiting for caches to sync");
    tokio::select! {
        result = caches.ready() => result?,
        _ = shutdown_signal() => {
            info!("Interrupted before caches synced");
            watches.iter().for_each(JoinHandle::abort);
            return Ok(());
        }
    }
    info!("Caches synced, starting workers");
    watches.push(tokio::spawn(resync_every(config.resync(), caches.clone(), routes.clone())));

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let state = ServerState {
        store: store.clone(),
        settings: Arc::new(RenderSettings::from(&config)),
    };
    let listen = config.listen;
    let endpoint = tokio::spawn(async move {
        let stopped = async move {
            let _ = stop_rx.changed().await;
        };
        if let Err(e) = server::serve(listen, state, stopped).await {
            error!("Tunnel-config endpoint failed: {e}");
        }
    });

    let timeout = config.reconcile_timeout();
    let workers = config.workers;
    let ctx = Arc::new(ReconcileContext::new(store, PortAllocator::shared(), config));

    let pools = {
        let (ingress_ctx, namespace_ctx, node_ctx) = (ctx.clone(), ctx.clone(), ctx);
        vec![
            spawn_pool(&routes.ingress_queue, workers, move |key| {
                with_timeout(timeout, reconcile_ingress(key, ingress_ctx.clone()))
            }),
            spawn_pool(&routes.namespace_queue, workers, move |key| {
                with_timeout(timeout, reconcile_namespace(key, namespace_ctx.clone()))
            }),
            spawn_pool(&routes.node_queue, workers, move |key| {
                with_timeout(timeout, reconcile_node(key, node_ctx.clone()))
            }),
        ]
    };

    shutdown_signal().await;
    info!("Shutting down");

    watches.iter().for_each(JoinHandle::abort);
    for queue in [&routes.ingress_queue, &routes.namespace_queue, &routes.node_queue] {
        queue.shutdown();
    }
    for pool in pools {
        if let Err(e) = pool.await {
            warn!("Worker pool terminated abnormally: {e}");
        }
    }

    let _ = stop_tx.send(true);
    if let Err(e) = endpoint.await {
        warn!("Tunnel-config endpoint terminated abnormally: {e}");
    }
    info!("Controller stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Mutex};

    use super::*;
    use crate::{
        INGRESS_CLASS_ANNOTATION,
        reconcile::testing::{SYSTEM_NAMESPACE, ingress, namespace, node, service},
    };

    /// Records changes together with whether the cache already held the object.
    struct Recorder<K: Resource<DynamicType = ()> + Clone + 'static> {
        cache: Store<K>,
        seen: Mutex<Vec<String>>,
    }

    impl<K: Resource<DynamicType = ()> + Clone + 'static> Recorder<K> {
        fn new(cache: Store<K>) -> Self {
            Self {
                cache,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn take(&self) -> Vec<String> {
            mem::take(&mut *self.seen.lock().unwrap())
        }
    }

    impl<K: Resource<DynamicType = ()> + Clone + 'static> Dispatch<K> for Recorder<K> {
        fn dispatch(&self, change: Change<'_, K>) {
            let cached = self.cache.get(&ObjectRef::from_obj(change.current())).is_some();
            let version = |obj: &K| obj.meta().resource_version.clone().unwrap_or_default();
            let entry = match change {
                Change::Added(obj) => format!("added {} cached={cached}", version(obj)),
                Change::Updated { old, new } => {
                    format!("updated {}->{} cached={cached}", version(old), version(new))
                }
                Change::Deleted(obj) => format!("deleted {} cached={cached}", version(obj)),
            };
            self.seen.lock().unwrap().push(entry);
        }
    }

    fn tenant_namespace(version: &str) -> Namespace {
        let mut ns = namespace("acme", Some("acme-co"));
        ns.metadata.resource_version = Some(version.into());
        ns
    }

    fn routes(ingresses: Store<Ingress>, namespaces: Store<Namespace>) -> Routes {
        Routes {
            ingress_queue: WorkQueue::new("ingress"),
            namespace_queue: WorkQueue::new("namespace"),
            node_queue: WorkQueue::new("node"),
            ingresses,
            namespaces,
        }
    }

    async fn drain(queue: &WorkQueue) -> Vec<String> {
        let mut keys = Vec::new();
        while !queue.is_empty() {
            let Some(key) = queue.get().await else { break };
            queue.done(&key);
            keys.push(key);
        }
        keys.sort();
        keys
    }

    #[test]
    fn relisted_objects_are_dispatched_once_cached() {
        let (cache, writer) = reflector::store::<Namespace>();
        let recorder = Recorder::new(cache);
        let mut reflect = Reflect::new(writer);

        reflect.apply(Event::Init, &recorder);
        reflect.apply(Event::InitDone, &recorder);
        assert!(recorder.take().is_empty());

        // A relist after the watch lost track of the namespace's creation.
        reflect.apply(Event::Init, &recorder);
        reflect.apply(Event::InitApply(tenant_namespace("1")), &recorder);
        assert!(recorder.take().is_empty());
        reflect.apply(Event::InitDone, &recorder);
        assert_eq!(recorder.take(), vec!["added 1 cached=true"]);

        // Relisting a known object is an update against the previous snapshot.
        reflect.apply(Event::Init, &recorder);
        reflect.apply(Event::InitApply(tenant_namespace("2")), &recorder);
        reflect.apply(Event::InitDone, &recorder);
        assert_eq!(recorder.take(), vec!["updated 1->2 cached=true"]);
    }

    #[test]
    fn applied_events_carry_the_previous_version() {
        let (cache, writer) = reflector::store::<Namespace>();
        let recorder = Recorder::new(cache.clone());
        let mut reflect = Reflect::new(writer);

        reflect.apply(Event::Apply(tenant_namespace("1")), &recorder);
        reflect.apply(Event::Apply(tenant_namespace("2")), &recorder);
        reflect.apply(Event::Delete(tenant_namespace("3")), &recorder);
        assert_eq!(
            recorder.take(),
            vec!["added 1 cached=true", "updated 1->2 cached=true", "deleted 3 cached=false"]
        );
        assert!(cache.state().is_empty());
    }

    #[tokio::test]
    async fn node_updates_need_a_new_resource_version() {
        let (ingresses, _ingress_writer) = reflector::store::<Ingress>();
        let (namespaces, _namespace_writer) = reflector::store::<Namespace>();
        let (nodes, node_writer) = reflector::store::<Node>();
        let routes = routes(ingresses, namespaces);
        let mut reflect = Reflect::new(node_writer);

        let v1 = node("worker-1", Some("acme-co"));
        let mut v2 = v1.clone();
        v2.metadata.resource_version = Some("2".into());

        reflect.apply(Event::Apply(v1.clone()), &routes);
        assert_eq!(drain(&routes.node_queue).await, vec!["worker-1"]);
        reflect.apply(Event::Apply(v1), &routes);
        assert!(routes.node_queue.is_empty());
        reflect.apply(Event::Apply(v2), &routes);
        assert_eq!(drain(&routes.node_queue).await, vec!["worker-1"]);

        // The periodic resync does not touch unchanged nodes.
        resync(&nodes, &routes);
        assert!(routes.node_queue.is_empty());
    }

    #[tokio::test]
    async fn tenant_namespace_requeues_its_ingresses() {
        let (ingresses, mut ingress_writer) = reflector::store::<Ingress>();
        let (namespaces, namespace_writer) = reflector::store::<Namespace>();
        let mut nginx = ingress("acme", "legacy");
        nginx.metadata.annotations = Some(BTreeMap::from([(INGRESS_CLASS_ANNOTATION.into(), "nginx".into())]));
        for obj in [ingress("acme", "shop"), ingress("other", "web"), nginx] {
            ingress_writer.apply_watcher_event(&Event::Apply(obj));
        }
        let routes = routes(ingresses, namespaces);
        let mut reflect = Reflect::new(namespace_writer);

        // Labelling the namespace after its Ingress was created.
        reflect.apply(Event::Apply(namespace("acme", None)), &routes);
        assert!(routes.ingress_queue.is_empty());
        reflect.apply(Event::Apply(namespace("acme", Some("acme-co"))), &routes);

        assert_eq!(drain(&routes.namespace_queue).await, vec!["acme"]);
        assert_eq!(drain(&routes.ingress_queue).await, vec!["acme/shop"]);
    }

    #[tokio::test]
    async fn deleted_service_requeues_tenant_namespaces() {
        let (ingresses, _ingress_writer) = reflector::store::<Ingress>();
        let (namespaces, mut namespace_writer) = reflector::store::<Namespace>();
        for obj in [namespace("acme", Some("acme-co")), namespace("plain", None)] {
            namespace_writer.apply_watcher_event(&Event::Apply(obj));
        }
        let (_services, service_writer) = reflector::store::<Service>();
        let routes = routes(ingresses, namespaces);
        let mut reflect = Reflect::new(service_writer);

        let broker = service(SYSTEM_NAMESPACE, "globex");
        reflect.apply(Event::Apply(broker.clone()), &routes);
        assert!(routes.namespace_queue.is_empty());
        reflect.apply(Event::Delete(broker), &routes);
        assert_eq!(drain(&routes.namespace_queue).await, vec!["acme"]);
    }

    #[tokio::test]
    async fn resync_requeues_cached_objects() {
        let (ingresses, mut ingress_writer) = reflector::store::<Ingress>();
        let (namespaces, mut namespace_writer) = reflector::store::<Namespace>();
        ingress_writer.apply_watcher_event(&Event::Apply(ingress("acme", "shop")));
        namespace_writer.apply_watcher_event(&Event::Apply(namespace("acme", Some("acme-co"))));
        let routes = routes(ingresses.clone(), namespaces.clone());

        resync(&namespaces, &routes);
        resync(&ingresses, &routes);
        assert_eq!(drain(&routes.namespace_queue).await, vec!["acme"]);
        assert_eq!(drain(&routes.ingress_queue).await, vec!["acme/shop"]);
    }

    #[tokio::test]
    async fn caches_are_ready_once_every_kind_is_listed() {
        let (ingresses, mut ingress_writer) = reflector::store::<Ingress>();
        let (namespaces, mut namespace_writer) = reflector::store::<Namespace>();
        let (nodes, mut node_writer) = reflector::store::<Node>();
        let (services, mut service_writer) = reflector::store::<Service>();
        let caches = Caches {
            ingresses,
            namespaces,
            nodes,
            services,
        };

        ingress_writer.apply_watcher_event(&Event::Init);
        ingress_writer.apply_watcher_event(&Event::InitDone);
        namespace_writer.apply_watcher_event(&Event::Init);
        namespace_writer.apply_watcher_event(&Event::InitDone);
        node_writer.apply_watcher_event(&Event::Init);
        node_writer.apply_watcher_event(&Event::InitDone);
        let waiting = tokio::time::timeout(Duration::from_millis(50), caches.ready()).await;
        assert!(waiting.is_err(), "services are not listed yet");

        service_writer.apply_watcher_event(&Event::Init);
        service_writer.apply_watcher_event(&Event::InitDone);
        let ready = tokio::time::timeout(Duration::from_secs(5), caches.ready()).await;
        assert!(matches!(ready, Ok(Ok(()))));
    }
}

use crate::resource_id::ResourceId;
use chrono::Utc;
use ctxforge_k8s_api::{
    self as k8s,
    annotations::FORWARDER_CONTAINER_NAME,
    labels,
    policy::{HeaderPropagationPolicy, HeaderPropagationPolicyStatus},
    Resource, ResourceExt,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

const API_VERSION: &str = "ctxforge.io/v1alpha1";
const STATUS_CONTROLLER_NAME: &str = "ctxforge.io/status-controller";

/// How often the safety-net sweep re-examines indexed policies. Policies
/// with Pending matches re-reconcile every sweep; policies with no matches
/// at all re-reconcile every [`SAFETY_NET_TICKS`] sweeps.
pub const SWEEP_PERIOD: Duration = Duration::from_secs(10);
const SAFETY_NET_TICKS: u64 = 3;

pub type SharedIndex = Arc<RwLock<Index>>;

/// A reconciliation request for one policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Update {
    pub id: ResourceId,
}

/// Watch-fed view of policies and pods, used to decide *when* to
/// reconcile; the [`Controller`] re-reads authoritative state from the API
/// when it acts.
pub struct Index {
    updates: UnboundedSender<Update>,
    policies: HashMap<ResourceId, PolicyMeta>,
    pods: HashMap<String, HashMap<String, PodFacts>>,
}

struct PolicyMeta {
    selector: Option<labels::Selector>,
}

struct PodFacts {
    labels: labels::Map,
    phase: Option<String>,
    has_forwarder: bool,
}

impl PodFacts {
    fn of(pod: &k8s::Pod) -> Self {
        Self {
            labels: pod.metadata.labels.clone().unwrap_or_default(),
            phase: pod.status.as_ref().and_then(|s| s.phase.clone()),
            has_forwarder: pod
                .spec
                .as_ref()
                .map(|spec| {
                    spec.containers
                        .iter()
                        .any(|c| c.name == FORWARDER_CONTAINER_NAME)
                })
                .unwrap_or(false),
        }
    }
}

impl Index {
    pub fn shared(updates: UnboundedSender<Update>) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            updates,
            policies: HashMap::new(),
            pods: HashMap::new(),
        }))
    }

    /// Periodically re-enqueues policies whose state is likely to settle
    /// without a watch event: Pending pods that will start Running, and
    /// zero-match policies as a safety net.
    pub async fn run(index: SharedIndex, period: Duration) {
        let mut interval = tokio::time::interval(period);
        // The first tick fires immediately; skip it so freshly-applied
        // policies are not reconciled twice in quick succession.
        interval.tick().await;
        let mut ticks: u64 = 0;
        loop {
            interval.tick().await;
            ticks += 1;
            index.write().sweep(ticks);
        }
    }

    pub(crate) fn sweep(&mut self, ticks: u64) {
        let mut requeue = Vec::new();
        for (id, meta) in &self.policies {
            let mut matched = 0usize;
            let mut pending = false;
            if let Some(pods) = self.pods.get(&id.namespace) {
                for facts in pods.values() {
                    let selected = meta
                        .selector
                        .as_ref()
                        .map(|s| s.matches(&facts.labels))
                        .unwrap_or(true);
                    if !selected {
                        continue;
                    }
                    matched += 1;
                    if facts.has_forwarder && facts.phase.as_deref() == Some("Pending") {
                        pending = true;
                    }
                }
            }
            if pending || (matched == 0 && ticks % SAFETY_NET_TICKS == 0) {
                requeue.push(id.clone());
            }
        }
        for id in requeue {
            debug!(%id, "sweep requeue");
            self.enqueue(id);
        }
    }

    fn enqueue(&mut self, id: ResourceId) {
        if let Err(error) = self.updates.send(Update { id: id.clone() }) {
            tracing::error!(%id, %error, "failed to enqueue policy update");
        }
    }

    fn enqueue_namespace(&mut self, namespace: &str) {
        let ids: Vec<ResourceId> = self
            .policies
            .keys()
            .filter(|id| id.namespace == namespace)
            .cloned()
            .collect();
        for id in ids {
            self.enqueue(id);
        }
    }
}

impl kubert::index::IndexNamespacedResource<HeaderPropagationPolicy> for Index {
    fn apply(&mut self, policy: HeaderPropagationPolicy) {
        let namespace = policy.namespace().expect("policy must have a namespace");
        let name = policy.name_unchecked();
        let id = ResourceId::new(namespace, name);

        self.policies.insert(
            id.clone(),
            PolicyMeta {
                selector: policy.spec.pod_selector,
            },
        );
        self.enqueue(id);
    }

    fn delete(&mut self, namespace: String, name: String) {
        // The object is gone; there is no status left to maintain.
        self.policies.remove(&ResourceId::new(namespace, name));
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Pod> for Index {
    fn apply(&mut self, pod: k8s::Pod) {
        let namespace = pod.namespace().expect("pod must have a namespace");
        let name = pod.name_unchecked();

        self.pods
            .entry(namespace.clone())
            .or_default()
            .insert(name, PodFacts::of(&pod));
        self.enqueue_namespace(&namespace);
    }

    fn delete(&mut self, namespace: String, name: String) {
        if let Some(pods) = self.pods.get_mut(&namespace) {
            pods.remove(&name);
            if pods.is_empty() {
                self.pods.remove(&namespace);
            }
        }
        self.enqueue_namespace(&namespace);
    }
}

/// Drains reconciliation requests and patches policy statuses.
pub struct Controller {
    client: k8s::Client,
    updates: UnboundedReceiver<Update>,
}

impl Controller {
    pub fn new(client: k8s::Client, updates: UnboundedReceiver<Update>) -> Self {
        Self { client, updates }
    }

    pub async fn run(mut self) {
        let patch_params = k8s::PatchParams::apply(STATUS_CONTROLLER_NAME);
        while let Some(Update { id }) = self.updates.recv().await {
            self.reconcile(id, &patch_params).await;
        }
    }

    async fn reconcile(&self, id: ResourceId, patch_params: &k8s::PatchParams) {
        let api = k8s::Api::<HeaderPropagationPolicy>::namespaced(
            self.client.clone(),
            &id.namespace,
        );
        let policy = match api.get_opt(&id.name).await {
            Ok(Some(policy)) => policy,
            Ok(None) => return,
            Err(error) => {
                info!(%id, %error, "failed to fetch policy");
                return;
            }
        };

        let status = self.observe(&policy, &id).await;
        let patch = make_patch(&id.name, status);
        if let Err(error) = api
            .patch_status(&id.name, patch_params, &k8s::Patch::Merge(patch))
            .await
        {
            info!(%id, %error, "failed to patch policy status");
        }
    }

    /// Builds the status this policy should carry right now: selector
    /// compilation, an authoritative pod list, and the counts over it.
    async fn observe(
        &self,
        policy: &HeaderPropagationPolicy,
        id: &ResourceId,
    ) -> HeaderPropagationPolicyStatus {
        let mut status = self.build_status(policy, id).await;
        preserve_transition_times(&mut status, policy.status.as_ref());
        status
    }

    async fn build_status(
        &self,
        policy: &HeaderPropagationPolicy,
        id: &ResourceId,
    ) -> HeaderPropagationPolicyStatus {
        if let Some(selector) = &policy.spec.pod_selector {
            if let Err(error) = selector.validate() {
                info!(%id, %error, "policy selector is invalid");
                return error_status(policy, "InvalidSelector", error.to_string());
            }
        }

        let pod_api = k8s::Api::<k8s::Pod>::namespaced(self.client.clone(), &id.namespace);
        let pods = match pod_api.list(&k8s::ListParams::default()).await {
            Ok(list) => list.items,
            Err(error) => {
                info!(%id, %error, "failed to list pods");
                return error_status(policy, "ListPodsFailed", error.to_string());
            }
        };

        let counts = count_pods(policy.spec.pod_selector.as_ref(), &pods);
        applied_status(policy, counts)
    }
}

/// A condition's lastTransitionTime moves only when its status flips, not
/// on every reconcile pass.
pub fn preserve_transition_times(
    status: &mut HeaderPropagationPolicyStatus,
    previous: Option<&HeaderPropagationPolicyStatus>,
) {
    let Some(previous) = previous else {
        return;
    };
    for condition in &mut status.conditions {
        if let Some(prior) = previous
            .conditions
            .iter()
            .find(|c| c.type_ == condition.type_)
        {
            if prior.status == condition.status {
                condition.last_transition_time = prior.last_transition_time.clone();
            }
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PodCounts {
    /// Running pods carrying the forwarder container.
    pub running: usize,
    /// Pending pods carrying the forwarder container.
    pub pending: usize,
}

/// Counts forwarder-bearing pods selected by `selector`, by phase.
pub fn count_pods(selector: Option<&labels::Selector>, pods: &[k8s::Pod]) -> PodCounts {
    let mut counts = PodCounts::default();
    for pod in pods {
        let labels = pod.metadata.labels.clone().unwrap_or_default();
        let selected = selector.map(|s| s.matches(&labels)).unwrap_or(true);
        if !selected {
            continue;
        }
        let has_forwarder = pod
            .spec
            .as_ref()
            .map(|spec| {
                spec.containers
                    .iter()
                    .any(|c| c.name == FORWARDER_CONTAINER_NAME)
            })
            .unwrap_or(false);
        if !has_forwarder {
            continue;
        }
        match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
            Some("Running") => counts.running += 1,
            Some("Pending") => counts.pending += 1,
            _ => {}
        }
    }
    counts
}

pub fn applied_status(
    policy: &HeaderPropagationPolicy,
    counts: PodCounts,
) -> HeaderPropagationPolicyStatus {
    let condition = if counts.running > 0 {
        ready_condition(
            policy,
            "True",
            "PolicyApplied",
            format!("policy applied to {} running pod(s)", counts.running),
        )
    } else {
        ready_condition(
            policy,
            "False",
            "NoMatchingPods",
            "no running pods with the forwarder match this policy".to_string(),
        )
    };
    HeaderPropagationPolicyStatus {
        observed_generation: policy.metadata.generation,
        applied_to_pods: counts.running as i32,
        conditions: vec![condition],
    }
}

pub fn error_status(
    policy: &HeaderPropagationPolicy,
    reason: &str,
    message: String,
) -> HeaderPropagationPolicyStatus {
    HeaderPropagationPolicyStatus {
        observed_generation: policy.metadata.generation,
        applied_to_pods: 0,
        conditions: vec![ready_condition(policy, "False", reason, message)],
    }
}

fn ready_condition(
    policy: &HeaderPropagationPolicy,
    status: &str,
    reason: &str,
    message: String,
) -> k8s::Condition {
    k8s::Condition {
        last_transition_time: k8s::Time(Utc::now()),
        message,
        observed_generation: policy.metadata.generation,
        reason: reason.to_string(),
        status: status.to_string(),
        type_: "Ready".to_string(),
    }
}

pub fn make_patch(name: &str, status: HeaderPropagationPolicyStatus) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": API_VERSION,
        "kind": HeaderPropagationPolicy::kind(&()),
        "name": name,
        "status": status,
    })
}

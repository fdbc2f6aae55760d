//! Graph-walking execution engine.
//!
//! The engine walks the dependency graph with a bounded worker pool. A unit
//! is scheduled only once all of its dependencies have succeeded; its inputs
//! are resolved from dependency outputs at that point, so the scheduler
//! never blocks on a half-finished unit. Transient provider failures are
//! retried per unit; terminal failures cascade `Skipped` to every transitive
//! dependent that has not started. Destroy mode walks the same graph with
//! edges reversed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::catalog::{AttrValue, DiscoveryQuery, ResourceKind, ResourceSpec};
use crate::error::{ProviderError, Result, StackforgeError};
use crate::graph::{Graph, UnitPayload};
use crate::planner::{ChangeKind, Plan};
use crate::provider::{
    CloudProvider, CreatedResource, DiscoveryResolver, PlacementPolicy, ResourceAttrs,
    ZoneFilter, ATTR_STATUS, STATUS_ACTIVE,
};
use crate::state::{RecordCell, RecordSet, StateRecord};

use super::context::RunContext;
use super::unit::{
    RunOutcome, SkipCause, UnitEvent, UnitFailure, UnitSkip, UnitState, UnitSuccess,
};

/// Maximum action attempts per unit for transient failures.
const ACTION_MAX_ATTEMPTS: u32 = 3;

/// Base action backoff delay in seconds.
const ACTION_BACKOFF_BASE_SECS: u64 = 1;

/// Action backoff delay cap in seconds.
const ACTION_BACKOFF_CAP_SECS: u64 = 15;

/// Walk direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalkMode {
    /// Create/update toward the desired state; edges as declared.
    Apply,
    /// Tear down; edges reversed, so a unit waits for its dependents.
    Destroy,
}

/// The prepared action for one scheduled unit.
enum UnitAction {
    /// Nothing to do; expose the given outputs.
    Noop {
        outputs: ResourceAttrs,
        detail: &'static str,
    },
    /// Resolve a discovery query and apply the placement filter.
    Discover { query: DiscoveryQuery },
    /// Create the resource and record it.
    Create {
        id: String,
        kind: ResourceKind,
        spec: std::collections::BTreeMap<String, AttrValue>,
        spec_hash: String,
        attrs: ResourceAttrs,
        cell: RecordCell,
    },
    /// Update the resource in place and refresh its record.
    Update {
        id: String,
        kind: ResourceKind,
        spec: std::collections::BTreeMap<String, AttrValue>,
        spec_hash: String,
        attrs: ResourceAttrs,
        provider_id: String,
        cell: RecordCell,
    },
    /// Destroy and recreate the resource.
    Replace {
        id: String,
        kind: ResourceKind,
        spec: std::collections::BTreeMap<String, AttrValue>,
        spec_hash: String,
        attrs: ResourceAttrs,
        old_provider_id: String,
        cell: RecordCell,
    },
    /// Delete the resource and drop its record.
    Delete {
        provider_id: Option<String>,
        cell: RecordCell,
    },
}

/// Graph-walking execution engine for one run.
pub struct ExecutionEngine {
    /// Cloud provider.
    provider: Arc<dyn CloudProvider>,
    /// Discovery resolver, scoped to this run.
    resolver: Arc<DiscoveryResolver>,
    /// Run context.
    ctx: Arc<RunContext>,
    /// Placement policy for discovered targets.
    policy: PlacementPolicy,
    /// Optional sink for streamed unit transitions.
    events: Option<mpsc::UnboundedSender<UnitEvent>>,
}

impl ExecutionEngine {
    /// Creates a new engine over the given provider and run context.
    #[must_use]
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        ctx: Arc<RunContext>,
        policy: PlacementPolicy,
    ) -> Self {
        let resolver = Arc::new(DiscoveryResolver::new(Arc::clone(&provider)));
        Self {
            provider,
            resolver,
            ctx,
            policy,
            events: None,
        }
    }

    /// Streams unit state transitions to the given channel as they occur.
    #[must_use]
    pub fn with_events(mut self, sender: mpsc::UnboundedSender<UnitEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Applies the plan: destroys orphaned records, then walks the graph in
    /// dependency order creating and updating resources.
    pub async fn apply(&self, graph: &Graph, plan: &Plan, records: &RecordSet) -> RunOutcome {
        info!("Starting apply run {}", self.ctx.run_id);

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();

        // Orphaned records have no graph unit and nothing depends on them;
        // tear them down before building toward the desired state.
        for orphan in plan.destroy_ids() {
            self.destroy_orphan(orphan, records, &mut succeeded, &mut failed)
                .await;
        }

        let (walk_succeeded, walk_failed, skipped) =
            self.walk(graph, WalkMode::Apply, Some(plan), records).await;

        succeeded.extend(walk_succeeded);
        failed.extend(walk_failed);
        RunOutcome::from_results(succeeded, failed, skipped)
    }

    /// Destroys all recorded resources in reverse dependency order.
    pub async fn destroy(&self, graph: &Graph, records: &RecordSet) -> RunOutcome {
        info!("Starting destroy run {}", self.ctx.run_id);

        let (mut succeeded, mut failed, skipped) =
            self.walk(graph, WalkMode::Destroy, None, records).await;

        // Records with no declared counterpart are not graph units; nothing
        // declared depends on them, so they go last in any order.
        for id in records.ids() {
            if graph.index_of(&id).is_none() {
                self.destroy_orphan(&id, records, &mut succeeded, &mut failed)
                    .await;
            }
        }

        RunOutcome::from_results(succeeded, failed, skipped)
    }

    /// Deletes one orphaned record outside the graph walk.
    async fn destroy_orphan(
        &self,
        id: &str,
        records: &RecordSet,
        succeeded: &mut Vec<UnitSuccess>,
        failed: &mut Vec<UnitFailure>,
    ) {
        let Some(cell) = records.cell(id) else {
            return;
        };
        let provider_id = cell.lock().await.as_ref().map(|r| r.provider_id.clone());

        self.emit(id, UnitState::Running, None);
        let (attempts, result) = delete_resource(&*self.provider, provider_id, &cell).await;

        match result {
            Ok(_) => {
                info!("Destroyed orphaned resource {id}");
                self.emit(id, UnitState::Succeeded, None);
                succeeded.push(UnitSuccess {
                    unit: id.to_string(),
                    attempts,
                });
            }
            Err(e) => {
                error!("Failed to destroy orphaned resource {id}: {e}");
                self.emit(id, UnitState::Failed, Some(e.to_string()));
                failed.push(UnitFailure {
                    unit: id.to_string(),
                    error: e.to_string(),
                    attempts,
                });
            }
        }
    }

    /// Walks the graph in the given mode.
    async fn walk(
        &self,
        graph: &Graph,
        mode: WalkMode,
        plan: Option<&Plan>,
        records: &RecordSet,
    ) -> (Vec<UnitSuccess>, Vec<UnitFailure>, Vec<UnitSkip>) {
        let n = graph.len();
        let deps_of = |unit: usize| match mode {
            WalkMode::Apply => graph.dependencies_of(unit),
            WalkMode::Destroy => graph.dependents_of(unit),
        };
        let dependents_of = |unit: usize| match mode {
            WalkMode::Apply => graph.dependents_of(unit),
            WalkMode::Destroy => graph.dependencies_of(unit),
        };

        let mut states = vec![UnitState::Pending; n];
        let mut remaining: Vec<usize> = (0..n).map(|u| deps_of(u).len()).collect();
        let mut outputs: Vec<Option<Arc<ResourceAttrs>>> = vec![None; n];

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        let mut skipped = Vec::new();

        let semaphore = Arc::new(Semaphore::new(self.ctx.workers));
        let mut tasks: JoinSet<(usize, u32, Result<ResourceAttrs>)> = JoinSet::new();
        let mut ready: VecDeque<usize> =
            (0..n).filter(|&u| remaining[u] == 0).collect();

        loop {
            while !self.ctx.is_cancelled()
                && let Some(unit) = ready.pop_front()
            {
                if states[unit] != UnitState::Pending {
                    continue;
                }
                let unit_id = graph.unit(unit).id.clone();
                match self.prepare_action(graph, unit, mode, plan, records, &outputs).await {
                    Ok(action) => {
                        states[unit] = UnitState::Running;
                        self.emit(&unit_id, UnitState::Running, None);

                        let semaphore = Arc::clone(&semaphore);
                        let provider = Arc::clone(&self.provider);
                        let resolver = Arc::clone(&self.resolver);
                        let ctx = Arc::clone(&self.ctx);
                        let policy = self.policy.clone();
                        tasks.spawn(async move {
                            let _permit = semaphore.acquire_owned().await.ok();
                            let (attempts, result) =
                                run_action(action, &*provider, &resolver, &ctx, &policy).await;
                            (unit, attempts, result)
                        });
                    }
                    Err(e) => {
                        // Input resolution failed; the unit fails without a
                        // provider attempt.
                        states[unit] = UnitState::Failed;
                        self.emit(&unit_id, UnitState::Failed, Some(e.to_string()));
                        failed.push(UnitFailure {
                            unit: unit_id.clone(),
                            error: e.to_string(),
                            attempts: 0,
                        });
                        self.cascade_skip(
                            graph,
                            unit,
                            &unit_id,
                            &dependents_of,
                            &mut states,
                            &mut skipped,
                        );
                    }
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let Ok((unit, attempts, result)) = joined else {
                error!("Execution unit task aborted unexpectedly");
                continue;
            };
            let unit_id = graph.unit(unit).id.clone();

            match result {
                Ok(outs) => {
                    states[unit] = UnitState::Succeeded;
                    outputs[unit] = Some(Arc::new(outs));
                    self.emit(&unit_id, UnitState::Succeeded, None);
                    succeeded.push(UnitSuccess {
                        unit: unit_id,
                        attempts,
                    });

                    for &dependent in dependents_of(unit) {
                        remaining[dependent] -= 1;
                        if remaining[dependent] == 0 {
                            ready.push_back(dependent);
                        }
                    }
                }
                Err(e) => {
                    states[unit] = UnitState::Failed;
                    self.emit(&unit_id, UnitState::Failed, Some(e.to_string()));
                    failed.push(UnitFailure {
                        unit: unit_id.clone(),
                        error: e.to_string(),
                        attempts,
                    });
                    self.cascade_skip(
                        graph,
                        unit,
                        &unit_id,
                        &dependents_of,
                        &mut states,
                        &mut skipped,
                    );
                }
            }
        }

        // Units never scheduled because the run was cancelled.
        for unit in 0..n {
            if states[unit] == UnitState::Pending {
                let unit_id = graph.unit(unit).id.clone();
                states[unit] = UnitState::Skipped;
                self.emit(&unit_id, UnitState::Skipped, Some(String::from("run cancelled")));
                skipped.push(UnitSkip {
                    unit: unit_id,
                    cause: SkipCause::Cancelled,
                });
            }
        }

        (succeeded, failed, skipped)
    }

    /// Marks every not-yet-started transitive dependent of a failed unit as
    /// skipped.
    fn cascade_skip<'a, F>(
        &self,
        graph: &Graph,
        from: usize,
        from_id: &str,
        dependents_of: &F,
        states: &mut [UnitState],
        skipped: &mut Vec<UnitSkip>,
    ) where
        F: Fn(usize) -> &'a [usize],
    {
        let mut stack = vec![from];
        while let Some(unit) = stack.pop() {
            for &dependent in dependents_of(unit) {
                if states[dependent] == UnitState::Pending {
                    states[dependent] = UnitState::Skipped;
                    let id = graph.unit(dependent).id.clone();
                    warn!("Skipping {id}: dependency '{from_id}' failed");
                    self.emit(
                        &id,
                        UnitState::Skipped,
                        Some(format!("dependency '{from_id}' failed")),
                    );
                    skipped.push(UnitSkip {
                        unit: id,
                        cause: SkipCause::FailedAncestor(from_id.to_string()),
                    });
                    stack.push(dependent);
                }
            }
        }
    }

    /// Prepares the action for a unit whose dependencies are all satisfied.
    async fn prepare_action(
        &self,
        graph: &Graph,
        unit: usize,
        mode: WalkMode,
        plan: Option<&Plan>,
        records: &RecordSet,
        outputs: &[Option<Arc<ResourceAttrs>>],
    ) -> Result<UnitAction> {
        let node = graph.unit(unit);
        match (&node.payload, mode) {
            (UnitPayload::Discovery(query), WalkMode::Apply) => Ok(UnitAction::Discover {
                query: query.clone(),
            }),
            (UnitPayload::Discovery(_), WalkMode::Destroy) => Ok(UnitAction::Noop {
                outputs: ResourceAttrs::new(),
                detail: "discovery has nothing to destroy",
            }),
            (UnitPayload::Resource(spec), WalkMode::Apply) => {
                self.prepare_resource_apply(graph, spec, plan, records, outputs)
                    .await
            }
            (UnitPayload::Resource(spec), WalkMode::Destroy) => {
                let cell = self.cell_for(records, &spec.id)?;
                let provider_id = cell.lock().await.as_ref().map(|r| r.provider_id.clone());
                if provider_id.is_none() {
                    return Ok(UnitAction::Noop {
                        outputs: ResourceAttrs::new(),
                        detail: "never created",
                    });
                }
                Ok(UnitAction::Delete { provider_id, cell })
            }
        }
    }

    /// Prepares the apply-mode action for a resource unit.
    async fn prepare_resource_apply(
        &self,
        graph: &Graph,
        spec: &ResourceSpec,
        plan: Option<&Plan>,
        records: &RecordSet,
        outputs: &[Option<Arc<ResourceAttrs>>],
    ) -> Result<UnitAction> {
        let change = plan
            .and_then(|p| p.change_for(&spec.id))
            .ok_or_else(|| {
                StackforgeError::internal(format!("Resource '{}' missing from plan", spec.id))
            })?;
        let cell = self.cell_for(records, &spec.id)?;

        match change.change {
            ChangeKind::NoChange => {
                let recorded = cell.lock().await.as_ref().map(|r| r.attributes.clone());
                Ok(UnitAction::Noop {
                    outputs: recorded.unwrap_or_default(),
                    detail: "up to date",
                })
            }
            ChangeKind::Create => Ok(UnitAction::Create {
                id: spec.id.clone(),
                kind: spec.kind,
                spec: spec.attributes.clone(),
                spec_hash: change.new_hash.clone().unwrap_or_default(),
                attrs: self.resolve_attributes(graph, spec, outputs)?,
                cell,
            }),
            ChangeKind::Update => {
                let provider_id = change.provider_id.clone().ok_or_else(|| {
                    StackforgeError::internal(format!(
                        "Update planned for '{}' without a provider id",
                        spec.id
                    ))
                })?;
                Ok(UnitAction::Update {
                    id: spec.id.clone(),
                    kind: spec.kind,
                    spec: spec.attributes.clone(),
                    spec_hash: change.new_hash.clone().unwrap_or_default(),
                    attrs: self.resolve_attributes(graph, spec, outputs)?,
                    provider_id,
                    cell,
                })
            }
            ChangeKind::Replace => {
                let old_provider_id = change.provider_id.clone().ok_or_else(|| {
                    StackforgeError::internal(format!(
                        "Replacement planned for '{}' without a provider id",
                        spec.id
                    ))
                })?;
                Ok(UnitAction::Replace {
                    id: spec.id.clone(),
                    kind: spec.kind,
                    spec: spec.attributes.clone(),
                    spec_hash: change.new_hash.clone().unwrap_or_default(),
                    attrs: self.resolve_attributes(graph, spec, outputs)?,
                    old_provider_id,
                    cell,
                })
            }
            ChangeKind::Destroy => Err(StackforgeError::internal(format!(
                "Declared resource '{}' planned for destroy",
                spec.id
            ))),
        }
    }

    /// Looks up the record cell for a resource.
    fn cell_for(&self, records: &RecordSet, id: &str) -> Result<RecordCell> {
        records.cell(id).ok_or_else(|| {
            StackforgeError::internal(format!("No record cell for resource '{id}'"))
        })
    }

    /// Materializes a resource's attributes from literals, dependency
    /// outputs, and discovery results.
    fn resolve_attributes(
        &self,
        graph: &Graph,
        spec: &ResourceSpec,
        outputs: &[Option<Arc<ResourceAttrs>>],
    ) -> Result<ResourceAttrs> {
        let mut resolved = ResourceAttrs::new();

        for (name, value) in &spec.attributes {
            let materialized = match value {
                AttrValue::Literal(literal) => literal.clone(),
                AttrValue::Reference {
                    resource,
                    attribute,
                } => {
                    let out = self.output_of(graph, outputs, resource)?;
                    out.get(attribute)
                        .cloned()
                        .ok_or_else(|| {
                            StackforgeError::internal(format!(
                                "Resource '{resource}' exposes no output attribute '{attribute}'"
                            ))
                        })?
                }
                AttrValue::Discovery(query) => {
                    let out = self.output_of(graph, outputs, &query.signature())?;
                    out.get("ids").cloned().ok_or_else(|| {
                        StackforgeError::internal(format!(
                            "Discovery '{}' produced no ids",
                            query.signature()
                        ))
                    })?
                }
            };
            resolved.insert(name.clone(), materialized);
        }

        resolved
            .entry(String::from("name"))
            .or_insert_with(|| serde_json::json!(self.ctx.resource_name(&spec.id)));

        Ok(resolved)
    }

    /// Returns the outputs of a succeeded unit by id.
    fn output_of(
        &self,
        graph: &Graph,
        outputs: &[Option<Arc<ResourceAttrs>>],
        id: &str,
    ) -> Result<Arc<ResourceAttrs>> {
        graph
            .index_of(id)
            .and_then(|idx| outputs[idx].clone())
            .ok_or_else(|| {
                StackforgeError::internal(format!("Outputs of unit '{id}' are not available"))
            })
    }

    /// Logs and streams one unit state transition.
    fn emit(&self, unit: &str, state: UnitState, detail: Option<String>) {
        match (state, &detail) {
            (UnitState::Failed, Some(d)) => error!("[{unit}] {state}: {d}"),
            (UnitState::Skipped, Some(d)) => warn!("[{unit}] {state}: {d}"),
            _ => info!("[{unit}] {state}"),
        }

        if let Some(sender) = &self.events {
            let _ = sender.send(UnitEvent {
                unit: unit.to_string(),
                state,
                detail,
            });
        }
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("run_id", &self.ctx.run_id)
            .finish_non_exhaustive()
    }
}

/// Runs one prepared action to a terminal result.
///
/// Returns the number of provider attempts alongside the unit outputs.
async fn run_action(
    action: UnitAction,
    provider: &dyn CloudProvider,
    resolver: &DiscoveryResolver,
    ctx: &RunContext,
    policy: &PlacementPolicy,
) -> (u32, Result<ResourceAttrs>) {
    match action {
        UnitAction::Noop { outputs, detail } => {
            debug!("Unit is a no-op: {detail}");
            (0, Ok(outputs))
        }
        UnitAction::Discover { query } => run_discovery(&query, resolver, policy).await,
        UnitAction::Create {
            id,
            kind,
            spec,
            spec_hash,
            attrs,
            cell,
        } => {
            let (attempts, result) = create_resource(provider, ctx, kind, &attrs).await;
            match result {
                Ok((created, outputs)) => {
                    let mut guard = cell.lock().await;
                    *guard = Some(StateRecord::new(
                        &id,
                        kind,
                        spec,
                        &spec_hash,
                        outputs.clone(),
                        &created.provider_id,
                    ));
                    (attempts, Ok(outputs))
                }
                Err(e) => (attempts, Err(e)),
            }
        }
        UnitAction::Update {
            id,
            kind,
            spec,
            spec_hash,
            attrs,
            provider_id,
            cell,
        } => {
            let (attempts, result) =
                update_resource(provider, ctx, kind, &provider_id, &attrs).await;
            match result {
                Ok(outputs) => {
                    let mut guard = cell.lock().await;
                    match guard.as_mut() {
                        Some(record) => record.apply_update(spec, &spec_hash, outputs.clone()),
                        None => {
                            *guard = Some(StateRecord::new(
                                &id,
                                kind,
                                spec,
                                &spec_hash,
                                outputs.clone(),
                                &provider_id,
                            ));
                        }
                    }
                    (attempts, Ok(outputs))
                }
                Err(e) => (attempts, Err(e)),
            }
        }
        UnitAction::Replace {
            id,
            kind,
            spec,
            spec_hash,
            attrs,
            old_provider_id,
            cell,
        } => {
            let (delete_attempts, deleted) =
                delete_resource(provider, Some(old_provider_id), &cell).await;
            if let Err(e) = deleted {
                return (delete_attempts, Err(e));
            }

            let (create_attempts, result) = create_resource(provider, ctx, kind, &attrs).await;
            let attempts = delete_attempts + create_attempts;
            match result {
                Ok((created, outputs)) => {
                    let mut guard = cell.lock().await;
                    *guard = Some(StateRecord::new(
                        &id,
                        kind,
                        spec,
                        &spec_hash,
                        outputs.clone(),
                        &created.provider_id,
                    ));
                    (attempts, Ok(outputs))
                }
                Err(e) => (attempts, Err(e)),
            }
        }
        UnitAction::Delete { provider_id, cell } => {
            let (attempts, result) = delete_resource(provider, provider_id, &cell).await;
            (attempts, result.map(|()| ResourceAttrs::new()))
        }
    }
}

/// Resolves one discovery query and applies the placement policy to subnet
/// results.
async fn run_discovery(
    query: &DiscoveryQuery,
    resolver: &DiscoveryResolver,
    policy: &PlacementPolicy,
) -> (u32, Result<ResourceAttrs>) {
    let result = match resolver.resolve(query).await {
        Ok(result) => result,
        Err(e) => return (0, Err(e)),
    };
    let attempts = result.attempts;

    let items = if matches!(query, DiscoveryQuery::SubnetsByVpc { .. }) {
        let filter = match placement_filter(policy, resolver).await {
            Ok(filter) => filter,
            Err(e) => return (attempts, Err(e)),
        };
        match filter.filter(&result.items) {
            Ok(eligible) => eligible,
            Err(e) => return (attempts, Err(e.into())),
        }
    } else {
        result.items.clone()
    };

    let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
    let zones: Vec<&str> = items.iter().filter_map(|i| i.zone.as_deref()).collect();

    let mut outputs = ResourceAttrs::new();
    outputs.insert(String::from("ids"), serde_json::json!(ids));
    outputs.insert(String::from("zones"), serde_json::json!(zones));
    outputs.insert(String::from("count"), serde_json::json!(items.len()));

    (attempts, Ok(outputs))
}

/// Materializes the zone filter for this run.
///
/// The dynamic variant asks the provider for the authoritative set of zones
/// it does not support for control-plane placement; the resolver caches the
/// answer for the rest of the run.
async fn placement_filter(
    policy: &PlacementPolicy,
    resolver: &DiscoveryResolver,
) -> Result<ZoneFilter> {
    match policy {
        PlacementPolicy::Static(filter) => Ok(filter.clone()),
        PlacementPolicy::DynamicExclusion => {
            let result = resolver
                .resolve(&DiscoveryQuery::UnsupportedZones {
                    kind: ResourceKind::Cluster,
                })
                .await?;
            let unsupported = result
                .items
                .iter()
                .filter_map(|item| item.zone.clone())
                .collect();
            Ok(ZoneFilter::Exclude(unsupported))
        }
    }
}

/// Creates a resource, polling it to readiness when the kind requires it.
async fn create_resource(
    provider: &dyn CloudProvider,
    ctx: &RunContext,
    kind: ResourceKind,
    attrs: &ResourceAttrs,
) -> (u32, Result<(CreatedResource, ResourceAttrs)>) {
    let mut last_error: Option<StackforgeError> = None;

    for attempt in 1..=ACTION_MAX_ATTEMPTS {
        if attempt > 1 {
            tokio::time::sleep(retry_delay(attempt, last_error.as_ref())).await;
            debug!("Retrying create (attempt {attempt} of {ACTION_MAX_ATTEMPTS})");
        }

        match provider.create(kind, attrs).await {
            Ok(created) => {
                let mut outputs = attrs.clone();
                outputs.extend(created.attributes.clone());
                outputs.insert(String::from("id"), serde_json::json!(created.provider_id));

                if kind.polls_until_active() {
                    match wait_until_active(provider, ctx, kind, &created.provider_id).await {
                        Ok(final_attrs) => outputs.extend(final_attrs),
                        Err(e) => return (attempt, Err(e)),
                    }
                }

                return (attempt, Ok((created, outputs)));
            }
            Err(e) if e.is_transient() => {
                warn!("Transient create failure: {e}");
                last_error = Some(e);
            }
            Err(e) => return (attempt, Err(e)),
        }
    }

    (
        ACTION_MAX_ATTEMPTS,
        Err(last_error
            .unwrap_or_else(|| StackforgeError::internal("create retries exhausted"))),
    )
}

/// Updates a resource in place.
async fn update_resource(
    provider: &dyn CloudProvider,
    ctx: &RunContext,
    kind: ResourceKind,
    provider_id: &str,
    attrs: &ResourceAttrs,
) -> (u32, Result<ResourceAttrs>) {
    let mut last_error: Option<StackforgeError> = None;

    for attempt in 1..=ACTION_MAX_ATTEMPTS {
        if attempt > 1 {
            tokio::time::sleep(retry_delay(attempt, last_error.as_ref())).await;
            debug!("Retrying update (attempt {attempt} of {ACTION_MAX_ATTEMPTS})");
        }

        match provider.update(provider_id, attrs).await {
            Ok(updated) => {
                let mut outputs = attrs.clone();
                outputs.extend(updated.attributes);
                outputs.insert(String::from("id"), serde_json::json!(provider_id));

                if kind.polls_until_active() {
                    match wait_until_active(provider, ctx, kind, provider_id).await {
                        Ok(final_attrs) => outputs.extend(final_attrs),
                        Err(e) => return (attempt, Err(e)),
                    }
                }

                return (attempt, Ok(outputs));
            }
            Err(e) if e.is_transient() => {
                warn!("Transient update failure: {e}");
                last_error = Some(e);
            }
            Err(e) => return (attempt, Err(e)),
        }
    }

    (
        ACTION_MAX_ATTEMPTS,
        Err(last_error
            .unwrap_or_else(|| StackforgeError::internal("update retries exhausted"))),
    )
}

/// Deletes a resource and clears its record. A provider id the provider no
/// longer knows counts as already deleted.
async fn delete_resource(
    provider: &dyn CloudProvider,
    provider_id: Option<String>,
    cell: &RecordCell,
) -> (u32, Result<()>) {
    let Some(provider_id) = provider_id else {
        cell.lock().await.take();
        return (0, Ok(()));
    };

    let mut last_error: Option<StackforgeError> = None;

    for attempt in 1..=ACTION_MAX_ATTEMPTS {
        if attempt > 1 {
            tokio::time::sleep(retry_delay(attempt, last_error.as_ref())).await;
            debug!("Retrying delete (attempt {attempt} of {ACTION_MAX_ATTEMPTS})");
        }

        match provider.delete(&provider_id).await {
            Ok(()) => {
                cell.lock().await.take();
                return (attempt, Ok(()));
            }
            Err(StackforgeError::Provider(ProviderError::NotFound { .. })) => {
                debug!("Resource {provider_id} already deleted");
                cell.lock().await.take();
                return (attempt, Ok(()));
            }
            Err(e) if e.is_transient() => {
                warn!("Transient delete failure: {e}");
                last_error = Some(e);
            }
            Err(e) => return (attempt, Err(e)),
        }
    }

    (
        ACTION_MAX_ATTEMPTS,
        Err(last_error
            .unwrap_or_else(|| StackforgeError::internal("delete retries exhausted"))),
    )
}

/// Polls a resource until the provider reports it active.
///
/// A read that comes back `NotFound` right after a write is the provider's
/// eventual consistency window, not an error; polling continues until the
/// per-kind timeout.
async fn wait_until_active(
    provider: &dyn CloudProvider,
    ctx: &RunContext,
    kind: ResourceKind,
    provider_id: &str,
) -> Result<ResourceAttrs> {
    let timeout = ctx.timeout_for(kind);
    let start = tokio::time::Instant::now();

    loop {
        match provider.read(provider_id).await {
            Ok(attrs) => {
                let status = attrs.get(ATTR_STATUS).and_then(|v| v.as_str());
                if status.is_none() || status == Some(STATUS_ACTIVE) {
                    return Ok(attrs);
                }
                debug!("Resource {provider_id} is {}", status.unwrap_or("unknown"));
            }
            Err(StackforgeError::Provider(ProviderError::NotFound { .. })) => {
                debug!("Resource {provider_id} not yet visible");
            }
            Err(e) if e.is_transient() => {
                warn!("Transient poll failure for {provider_id}: {e}");
            }
            Err(e) => return Err(e),
        }

        if start.elapsed() >= timeout {
            return Err(StackforgeError::Provider(ProviderError::Timeout {
                provider_id: provider_id.to_string(),
                expected_status: STATUS_ACTIVE.to_string(),
            }));
        }

        tokio::time::sleep(ctx.poll_interval).await;
    }
}

/// Computes the backoff delay before the given attempt, honoring a
/// provider-suggested Retry-After.
fn retry_delay(attempt: u32, last_error: Option<&StackforgeError>) -> Duration {
    let exponential = ACTION_BACKOFF_BASE_SECS << (attempt - 2).min(63);
    let suggested = last_error
        .and_then(StackforgeError::retry_delay_secs)
        .unwrap_or(0);
    Duration::from_secs(exponential.max(suggested).min(ACTION_BACKOFF_CAP_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use crate::catalog::{Catalog, CatalogParser};
    use crate::graph::GraphBuilder;
    use crate::planner::DiffEngine;
    use crate::provider::DiscoveredItem;
    use crate::state::StateFile;

    /// In-memory provider with scriptable per-resource create failures.
    struct ScriptedProvider {
        subnets: Vec<DiscoveredItem>,
        unsupported_zones: Vec<String>,
        create_failures: Mutex<HashMap<String, VecDeque<ProviderError>>>,
        created: Mutex<Vec<(String, ResourceKind, ResourceAttrs)>>,
        deleted: Mutex<Vec<String>>,
        create_calls: AtomicU32,
    }

    impl ScriptedProvider {
        fn new() -> Self {
            Self {
                subnets: vec![
                    DiscoveredItem::new("subnet-1", "a"),
                    DiscoveredItem::new("subnet-2", "b"),
                ],
                unsupported_zones: vec![],
                create_failures: Mutex::new(HashMap::new()),
                created: Mutex::new(Vec::new()),
                deleted: Mutex::new(Vec::new()),
                create_calls: AtomicU32::new(0),
            }
        }

        fn with_subnets(mut self, subnets: Vec<DiscoveredItem>) -> Self {
            self.subnets = subnets;
            self
        }

        fn with_unsupported_zones(mut self, zones: &[&str]) -> Self {
            self.unsupported_zones = zones.iter().map(|z| (*z).to_string()).collect();
            self
        }

        /// Scripts errors returned by successive creates of the named
        /// resource before it succeeds.
        fn fail_creates(&self, name: &str, errors: Vec<ProviderError>) {
            self.create_failures
                .lock()
                .unwrap()
                .insert(name.to_string(), errors.into());
        }

        fn created_names(&self) -> Vec<String> {
            self.created.lock().unwrap().iter().map(|(n, _, _)| n.clone()).collect()
        }

        fn created_attrs(&self, name_suffix: &str) -> ResourceAttrs {
            self.created
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(n, _, _)| n.ends_with(name_suffix))
                .map(|(_, _, a)| a.clone())
                .expect("resource was not created")
        }

        fn deleted_ids(&self) -> Vec<String> {
            self.deleted.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CloudProvider for ScriptedProvider {
        async fn create(
            &self,
            kind: ResourceKind,
            attributes: &ResourceAttrs,
        ) -> Result<CreatedResource> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            let name = attributes
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("unnamed")
                .to_string();

            let scripted_failure = {
                let mut failures = self.create_failures.lock().unwrap();
                failures.get_mut(&name).and_then(VecDeque::pop_front)
            };
            if let Some(error) = scripted_failure {
                return Err(StackforgeError::Provider(error));
            }

            let provider_id = format!("prov-{name}");
            let mut attrs = ResourceAttrs::new();
            attrs.insert(
                String::from("arn"),
                serde_json::json!(format!("arn:provider:{kind}/{name}")),
            );
            attrs.insert(String::from("name"), serde_json::json!(name.clone()));
            attrs.insert(String::from("status"), serde_json::json!("active"));

            self.created
                .lock()
                .unwrap()
                .push((name, kind, attributes.clone()));

            Ok(CreatedResource {
                provider_id,
                attributes: attrs,
            })
        }

        async fn read(&self, _provider_id: &str) -> Result<ResourceAttrs> {
            let mut attrs = ResourceAttrs::new();
            attrs.insert(String::from("status"), serde_json::json!("active"));
            Ok(attrs)
        }

        async fn update(
            &self,
            provider_id: &str,
            attributes: &ResourceAttrs,
        ) -> Result<CreatedResource> {
            Ok(CreatedResource {
                provider_id: provider_id.to_string(),
                attributes: attributes.clone(),
            })
        }

        async fn delete(&self, provider_id: &str) -> Result<()> {
            self.deleted.lock().unwrap().push(provider_id.to_string());
            Ok(())
        }

        async fn list(&self, query: &DiscoveryQuery) -> Result<Vec<DiscoveredItem>> {
            match query {
                DiscoveryQuery::SubnetsByVpc { .. } => Ok(self.subnets.clone()),
                DiscoveryQuery::UnsupportedZones { .. } => Ok(self
                    .unsupported_zones
                    .iter()
                    .map(|z| DiscoveredItem::new(z.clone(), z.clone()))
                    .collect()),
            }
        }
    }

    const TEST_CATALOG: &str = r#"
project:
  name: analytics
resources:
  - id: cluster_role
    kind: role
    attributes:
      assume_policy: clusters.provider.example
  - id: cluster_policy
    kind: policy_attachment
    attributes:
      role: "${cluster_role.name}"
      policy_arn: arn:provider:policy/cluster
  - id: cluster
    kind: cluster
    attributes:
      role_arn: "${cluster_role.arn}"
      subnet_ids: "${subnets:vpc-1}"
    depends_on: [cluster_policy]
  - id: workers
    kind: node_group
    attributes:
      cluster: "${cluster.name}"
      role_arn: "${cluster_role.arn}"
      subnet_ids: "${subnets:vpc-1}"
      instance_type: m5.large
      scaling:
        min: 1
        desired: 2
        max: 4
    depends_on: [cluster_policy]
"#;

    fn parse_catalog() -> Catalog {
        CatalogParser::new().parse_yaml(TEST_CATALOG, None).unwrap()
    }

    fn allow_all() -> PlacementPolicy {
        PlacementPolicy::Static(ZoneFilter::Allow(
            ["a", "b"].map(String::from).into(),
        ))
    }

    async fn run_apply(
        catalog: &Catalog,
        provider: &Arc<ScriptedProvider>,
        policy: PlacementPolicy,
        state: &mut StateFile,
    ) -> RunOutcome {
        let graph = GraphBuilder::new().build(catalog).unwrap();
        let records = RecordSet::from_state(state, catalog.resources.iter().map(|r| r.id.clone()));
        let diff = DiffEngine::new().compute_diff(catalog, &state.records);
        let plan = Plan::from_diff(diff, "test-hash");
        let ctx = Arc::new(RunContext::for_catalog(catalog));
        let engine = ExecutionEngine::new(
            Arc::clone(provider) as Arc<dyn CloudProvider>,
            ctx,
            policy,
        );

        let outcome = engine.apply(&graph, &plan, &records).await;
        records.flush_into(state).await;
        outcome
    }

    async fn run_destroy(
        catalog: &Catalog,
        provider: &Arc<ScriptedProvider>,
        state: &mut StateFile,
    ) -> RunOutcome {
        let graph = GraphBuilder::new().build(catalog).unwrap();
        let records = RecordSet::from_state(state, catalog.resources.iter().map(|r| r.id.clone()));
        let ctx = Arc::new(RunContext::for_catalog(catalog));
        let engine = ExecutionEngine::new(
            Arc::clone(provider) as Arc<dyn CloudProvider>,
            ctx,
            allow_all(),
        );

        let outcome = engine.destroy(&graph, &records).await;
        records.flush_into(state).await;
        outcome
    }

    fn position(names: &[String], suffix: &str) -> usize {
        names
            .iter()
            .position(|n| n.ends_with(suffix))
            .unwrap_or_else(|| panic!("no entry ending with {suffix}"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_creates_in_dependency_order() {
        let catalog = parse_catalog();
        let provider = Arc::new(ScriptedProvider::new());
        let mut state = StateFile::new("analytics", "dev");

        let outcome = run_apply(&catalog, &provider, allow_all(), &mut state).await;

        assert!(outcome.is_success(), "outcome: {outcome}");
        assert_eq!(state.records.len(), 4);

        let names = provider.created_names();
        assert!(position(&names, "cluster_role") < position(&names, "cluster_policy"));
        assert!(position(&names, "cluster_policy") < position(&names, "-cluster"));
        assert!(position(&names, "-cluster") < position(&names, "workers"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_outputs_flow_to_dependents() {
        let catalog = parse_catalog();
        let provider = Arc::new(ScriptedProvider::new());
        let mut state = StateFile::new("analytics", "dev");

        run_apply(&catalog, &provider, allow_all(), &mut state).await;

        let cluster_attrs = provider.created_attrs("-cluster");
        assert_eq!(
            cluster_attrs.get("role_arn"),
            Some(&serde_json::json!("arn:provider:role/analytics-dev-cluster_role"))
        );
        assert_eq!(
            cluster_attrs.get("subnet_ids"),
            Some(&serde_json::json!(["subnet-1", "subnet-2"]))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_cascades_to_transitive_dependents() {
        let catalog = parse_catalog();
        let provider = Arc::new(ScriptedProvider::new());
        provider.fail_creates(
            "analytics-dev-cluster_policy",
            vec![ProviderError::SchemaRejected {
                message: String::from("bad attachment"),
            }],
        );
        let mut state = StateFile::new("analytics", "dev");

        let outcome = run_apply(&catalog, &provider, allow_all(), &mut state).await;

        assert!(!outcome.is_success());
        let failed: Vec<&str> = outcome.failed().iter().map(|f| f.unit.as_str()).collect();
        assert_eq!(failed, vec!["cluster_policy"]);

        let mut skipped: Vec<&str> = outcome.skipped().iter().map(|s| s.unit.as_str()).collect();
        skipped.sort_unstable();
        assert_eq!(skipped, vec!["cluster", "workers"]);
        for skip in outcome.skipped() {
            assert_eq!(
                skip.cause,
                SkipCause::FailedAncestor(String::from("cluster_policy"))
            );
        }

        // The role and the discovery unit are unaffected.
        let succeeded: Vec<&str> = outcome.succeeded().iter().map(|s| s.unit.as_str()).collect();
        assert!(succeeded.contains(&"cluster_role"));
        assert!(succeeded.contains(&"subnets:vpc-1"));

        // Skipped units never reached the provider.
        let names = provider.created_names();
        assert!(!names.iter().any(|n| n.ends_with("-cluster")));
        assert!(!names.iter().any(|n| n.ends_with("workers")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_retried_to_success() {
        let catalog = parse_catalog();
        let provider = Arc::new(ScriptedProvider::new());
        provider.fail_creates(
            "analytics-dev-cluster_role",
            vec![
                ProviderError::RateLimited { retry_after_secs: 1 },
                ProviderError::RateLimited { retry_after_secs: 1 },
            ],
        );
        let mut state = StateFile::new("analytics", "dev");

        let outcome = run_apply(&catalog, &provider, allow_all(), &mut state).await;

        assert!(outcome.is_success(), "outcome: {outcome}");
        let role = outcome
            .succeeded()
            .iter()
            .find(|s| s.unit == "cluster_role")
            .unwrap();
        assert_eq!(role.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_retries_exhausted_fails_unit() {
        let catalog = parse_catalog();
        let provider = Arc::new(ScriptedProvider::new());
        provider.fail_creates(
            "analytics-dev-cluster_role",
            vec![
                ProviderError::network("reset"),
                ProviderError::network("reset"),
                ProviderError::network("reset"),
            ],
        );
        let mut state = StateFile::new("analytics", "dev");

        let outcome = run_apply(&catalog, &provider, allow_all(), &mut state).await;

        assert!(!outcome.is_success());
        let failure = outcome
            .failed()
            .iter()
            .find(|f| f.unit == "cluster_role")
            .unwrap();
        assert_eq!(failure.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_apply_is_idempotent() {
        let catalog = parse_catalog();
        let provider = Arc::new(ScriptedProvider::new());
        let mut state = StateFile::new("analytics", "dev");

        run_apply(&catalog, &provider, allow_all(), &mut state).await;
        let creates_after_first = provider.create_calls.load(Ordering::SeqCst);

        let outcome = run_apply(&catalog, &provider, allow_all(), &mut state).await;

        assert!(outcome.is_success());
        assert_eq!(provider.create_calls.load(Ordering::SeqCst), creates_after_first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_reverses_create_order() {
        let catalog = parse_catalog();
        let provider = Arc::new(ScriptedProvider::new());
        let mut state = StateFile::new("analytics", "dev");

        run_apply(&catalog, &provider, allow_all(), &mut state).await;
        let outcome = run_destroy(&catalog, &provider, &mut state).await;

        assert!(outcome.is_success(), "outcome: {outcome}");
        assert!(state.is_empty());

        let deleted = provider.deleted_ids();
        assert_eq!(deleted.len(), 4);
        assert!(position(&deleted, "workers") < position(&deleted, "-cluster"));
        assert!(position(&deleted, "-cluster") < position(&deleted, "cluster_policy"));
        assert!(position(&deleted, "cluster_policy") < position(&deleted, "cluster_role"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_eligible_targets_blocks_dependents() {
        let catalog = parse_catalog();
        let provider = Arc::new(
            ScriptedProvider::new().with_subnets(vec![DiscoveredItem::new("subnet-9", "e")]),
        );
        let mut state = StateFile::new("analytics", "dev");

        let outcome = run_apply(&catalog, &provider, allow_all(), &mut state).await;

        assert!(!outcome.is_success());
        let failure = outcome
            .failed()
            .iter()
            .find(|f| f.unit == "subnets:vpc-1")
            .unwrap();
        assert!(failure.error.contains("No eligible placement targets"));

        let mut skipped: Vec<&str> = outcome.skipped().iter().map(|s| s.unit.as_str()).collect();
        skipped.sort_unstable();
        assert_eq!(skipped, vec!["cluster", "workers"]);

        // The cluster creation never reached the provider.
        assert!(!provider.created_names().iter().any(|n| n.ends_with("-cluster")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dynamic_exclusion_filters_unsupported_zone() {
        let catalog = parse_catalog();
        let provider = Arc::new(
            ScriptedProvider::new()
                .with_subnets(vec![
                    DiscoveredItem::new("subnet-1", "a"),
                    DiscoveredItem::new("subnet-9", "e"),
                ])
                .with_unsupported_zones(&["e"]),
        );
        let mut state = StateFile::new("analytics", "dev");

        let outcome = run_apply(
            &catalog,
            &provider,
            PlacementPolicy::DynamicExclusion,
            &mut state,
        )
        .await;

        assert!(outcome.is_success(), "outcome: {outcome}");
        let cluster_attrs = provider.created_attrs("-cluster");
        assert_eq!(
            cluster_attrs.get("subnet_ids"),
            Some(&serde_json::json!(["subnet-1"]))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_incompatible_change_replaces_resource() {
        let mut catalog = parse_catalog();
        let provider = Arc::new(ScriptedProvider::new());
        let mut state = StateFile::new("analytics", "dev");

        run_apply(&catalog, &provider, allow_all(), &mut state).await;
        let old_provider_id = state.get("workers").unwrap().provider_id.clone();

        let workers = catalog
            .resources
            .iter_mut()
            .find(|r| r.id == "workers")
            .unwrap();
        workers.attributes.insert(
            String::from("instance_type"),
            AttrValue::Literal(serde_json::json!("m5.xlarge")),
        );

        let outcome = run_apply(&catalog, &provider, allow_all(), &mut state).await;

        assert!(outcome.is_success(), "outcome: {outcome}");
        assert_eq!(provider.deleted_ids(), vec![old_provider_id]);
        let workers_creates = provider
            .created_names()
            .iter()
            .filter(|n| n.ends_with("workers"))
            .count();
        assert_eq!(workers_creates, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_orphaned_record_destroyed_on_apply() {
        let catalog = parse_catalog();
        let provider = Arc::new(ScriptedProvider::new());
        let mut state = StateFile::new("analytics", "dev");
        state.put(StateRecord::new(
            "stale",
            ResourceKind::Role,
            std::collections::BTreeMap::new(),
            "old-hash",
            ResourceAttrs::new(),
            "prov-stale",
        ));

        let outcome = run_apply(&catalog, &provider, allow_all(), &mut state).await;

        assert!(outcome.is_success(), "outcome: {outcome}");
        assert!(provider.deleted_ids().contains(&String::from("prov-stale")));
        assert!(state.get("stale").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_run_skips_unscheduled_units() {
        let catalog = parse_catalog();
        let provider = Arc::new(ScriptedProvider::new());
        let mut state = StateFile::new("analytics", "dev");

        let graph = GraphBuilder::new().build(&catalog).unwrap();
        let records =
            RecordSet::from_state(&state, catalog.resources.iter().map(|r| r.id.clone()));
        let diff = DiffEngine::new().compute_diff(&catalog, &state.records);
        let plan = Plan::from_diff(diff, "test-hash");
        let ctx = Arc::new(RunContext::for_catalog(&catalog));
        ctx.cancel();
        let engine = ExecutionEngine::new(
            Arc::clone(&provider) as Arc<dyn CloudProvider>,
            Arc::clone(&ctx),
            allow_all(),
        );

        let outcome = engine.apply(&graph, &plan, &records).await;
        records.flush_into(&mut state).await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.skipped().len(), graph.len());
        assert!(outcome
            .skipped()
            .iter()
            .all(|s| s.cause == SkipCause::Cancelled));
        assert_eq!(provider.create_calls.load(Ordering::SeqCst), 0);
    }
}

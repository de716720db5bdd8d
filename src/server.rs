//! # Server Configuration
//!
//! Wires stores, runtimes and handlers into the application state and
//! assembles the router: the services surface under
//! `{admin_api_base}/services`, the workflow surface under
//! `/workflow/services`, probes at the root and Swagger UI at `/docs`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    Router, middleware,
    routing::{MethodRouter, get, post},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::auth::{AllowAllAuthorizer, Authorizer, auth_middleware, permissions};
use crate::callbacks::CallbackUrlResolver;
use crate::config::AppConfig;
use crate::crypto::{AesGcmSecretProvider, SecretProvider};
use crate::handlers::{
    self, activity, capabilities, connections,
    gate::{Idempotency, RouteGate, route_gate},
    installations, providers, status, subscriptions, sync, webhooks, workflow,
};
use crate::idempotency::IdempotencyStore;
use crate::inbound::{HandlerRegistry, InboundDispatcher};
use crate::lifecycle::notifications::{
    DefinitionResolver, LoggingNotificationSender, WebhookNotificationSender,
};
use crate::lifecycle::{
    ActivityProjector, ActivityRuntime, ActivitySink, NotificationSender, NotificationsProjector,
    OutboxDispatcher, ProjectorRegistry,
};
use crate::providers::{ProviderRegistry, register_builtin_packs};
use crate::repositories::Repositories;
use crate::service::ServicesFacade;
use crate::sync::SyncOrchestrator;
use crate::telemetry::request_context_middleware;
use crate::webhooks::{VerifierRegistry, WebhookProcessor};
use crate::worker::{JobEnqueuer, WorkerClient, WorkerRuntime};
use crate::workflow::{MemoryMappingStore, MemorySyncStore, WorkflowRuntime};

/// Mount point of the workflow surface.
pub const WORKFLOW_BASE_PATH: &str = "/workflow/services";

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub repos: Repositories,
    pub providers: Arc<ProviderRegistry>,
    pub facade: Arc<ServicesFacade>,
    pub sync: Arc<SyncOrchestrator>,
    pub dispatcher: Arc<OutboxDispatcher>,
    pub activity: Arc<ActivityRuntime>,
    pub webhooks: Arc<WebhookProcessor>,
    pub inbound: Arc<InboundDispatcher>,
    pub verifiers: Arc<VerifierRegistry>,
    pub idempotency: Arc<IdempotencyStore>,
    pub authorizer: Arc<dyn Authorizer>,
    pub worker: WorkerClient,
    pub workflow: Arc<WorkflowRuntime>,
    pub callbacks: Arc<CallbackUrlResolver>,
    /// Executes queued jobs; shared with external schedulers.
    pub runtime: Arc<WorkerRuntime>,
}

/// Builds [`AppState`] from configuration, with seams for host overrides.
pub struct AppStateBuilder {
    config: AppConfig,
    db: DatabaseConnection,
    authorizer: Option<Arc<dyn Authorizer>>,
    enqueuer: Option<Arc<dyn JobEnqueuer>>,
    handlers: Option<Arc<HandlerRegistry>>,
    activity_sink: Option<Arc<dyn ActivitySink>>,
    notification_sender: Option<Arc<dyn NotificationSender>>,
    verifiers: Option<Arc<VerifierRegistry>>,
    providers: Option<Arc<ProviderRegistry>>,
    workflow: Option<Arc<WorkflowRuntime>>,
}

impl AppStateBuilder {
    pub fn new(config: AppConfig, db: DatabaseConnection) -> Self {
        Self {
            config,
            db,
            authorizer: None,
            enqueuer: None,
            handlers: None,
            activity_sink: None,
            notification_sender: None,
            verifiers: None,
            providers: None,
            workflow: None,
        }
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Queue used when `worker.enqueue_enabled` is set.
    pub fn enqueuer(mut self, enqueuer: Arc<dyn JobEnqueuer>) -> Self {
        self.enqueuer = Some(enqueuer);
        self
    }

    pub fn handlers(mut self, handlers: Arc<HandlerRegistry>) -> Self {
        self.handlers = Some(handlers);
        self
    }

    /// Replaces the database-backed activity sink.
    pub fn activity_sink(mut self, sink: Arc<dyn ActivitySink>) -> Self {
        self.activity_sink = Some(sink);
        self
    }

    pub fn notification_sender(mut self, sender: Arc<dyn NotificationSender>) -> Self {
        self.notification_sender = Some(sender);
        self
    }

    pub fn verifiers(mut self, verifiers: Arc<VerifierRegistry>) -> Self {
        self.verifiers = Some(verifiers);
        self
    }

    /// Skips built-in pack registration.
    pub fn providers(mut self, providers: Arc<ProviderRegistry>) -> Self {
        self.providers = Some(providers);
        self
    }

    pub fn workflow(mut self, workflow: Arc<WorkflowRuntime>) -> Self {
        self.workflow = Some(workflow);
        self
    }

    pub fn build(self) -> anyhow::Result<AppState> {
        let config = Arc::new(self.config);
        let repos = Repositories::new(Arc::new(self.db));

        let providers = match self.providers {
            Some(providers) => providers,
            None => {
                let registry = Arc::new(ProviderRegistry::new());
                register_builtin_packs(&registry, &config)
                    .context("failed to register provider packs")?;
                registry
            }
        };
        let secrets: Arc<dyn SecretProvider> = Arc::new(
            AesGcmSecretProvider::from_config(&config).context("invalid encryption key")?,
        );
        let facade = Arc::new(ServicesFacade::new(
            repos.clone(),
            providers.clone(),
            secrets.clone(),
        ));
        let sync = Arc::new(SyncOrchestrator::new(
            repos.clone(),
            providers.clone(),
            secrets,
            &config.sync,
        ));

        let activity_sink = self
            .activity_sink
            .unwrap_or_else(|| Arc::new(repos.activity.clone()));
        let activity = Arc::new(ActivityRuntime::new(
            activity_sink,
            &config.lifecycle.activity,
        ));

        let projectors = Arc::new(ProjectorRegistry::new());
        projectors.register(Arc::new(ActivityProjector::new(
            activity.clone(),
            config.api.activity_action_label_overrides.clone(),
        )))?;
        let notifications = &config.lifecycle.notifications;
        if notifications.enabled {
            let sender: Arc<dyn NotificationSender> = match (self.notification_sender, &notifications.webhook_url) {
                (Some(sender), _) => sender,
                (None, Some(url)) => Arc::new(WebhookNotificationSender::new(
                    url,
                    Duration::from_secs(notifications.timeout_seconds),
                )?),
                (None, None) => Arc::new(LoggingNotificationSender),
            };
            projectors.register(Arc::new(NotificationsProjector::new(
                DefinitionResolver::new(notifications.definition_map.clone()),
                Arc::new(repos.notifications.clone()),
                sender,
            )))?;
        }
        let dispatcher = Arc::new(OutboxDispatcher::new(
            Arc::new(repos.outbox.clone()),
            projectors,
            config.lifecycle.dispatcher.clone(),
        ));

        let verifiers = self
            .verifiers
            .unwrap_or_else(|| Arc::new(VerifierRegistry::from_config(&config.webhook)));
        let handlers = self.handlers.unwrap_or_default();
        let webhooks = Arc::new(WebhookProcessor::new(
            Arc::new(repos.webhook_deliveries.clone()),
            verifiers.clone(),
            handlers.clone(),
            &config.webhook,
        ));
        let inbound = Arc::new(InboundDispatcher::new(
            handlers,
            verifiers.clone(),
            &config.inbound,
        ));

        let workflow = self.workflow.unwrap_or_else(|| {
            Arc::new(WorkflowRuntime::new(
                Arc::new(MemoryMappingStore::new()),
                Arc::new(MemorySyncStore::new()),
            ))
        });
        let runtime = Arc::new(WorkerRuntime::new(
            facade.clone(),
            sync.clone(),
            dispatcher.clone(),
            activity.clone(),
            webhooks.clone(),
        ));

        Ok(AppState {
            idempotency: Arc::new(IdempotencyStore::new(config.api.idempotency_ttl())),
            authorizer: self
                .authorizer
                .unwrap_or_else(|| Arc::new(AllowAllAuthorizer)),
            worker: WorkerClient::new(self.enqueuer, config.worker.enqueue_enabled),
            callbacks: Arc::new(CallbackUrlResolver::new(
                config.callbacks.clone(),
                &config.admin_api_base,
            )),
            config,
            repos,
            providers,
            facade,
            sync,
            dispatcher,
            activity,
            webhooks,
            inbound,
            verifiers,
            workflow,
            runtime,
        })
    }
}

/// Attach the permission and idempotency gate to one method router.
fn gated(
    state: &AppState,
    permission: &'static str,
    idempotency: Idempotency,
    route: MethodRouter<AppState>,
) -> MethodRouter<AppState> {
    route.route_layer(middleware::from_fn_with_state(
        RouteGate {
            state: state.clone(),
            permission,
            idempotency,
        },
        route_gate,
    ))
}

fn services_router(state: &AppState) -> Router<AppState> {
    use permissions::*;
    let guard = |permission, route| gated(state, permission, Idempotency::Client, route);
    let ingress = |route| gated(state, WEBHOOKS, Idempotency::Skip, route);

    Router::new()
        .route("/providers", guard(VIEW, get(providers::list_providers)))
        .route("/activity", guard(ACTIVITY_VIEW, get(activity::list_activity)))
        .route("/status", guard(ACTIVITY_VIEW, get(status::services_status)))
        .route(
            "/extensions/diagnostics",
            guard(VIEW, get(status::extension_diagnostics)),
        )
        .route(
            "/activity/retention/cleanup",
            guard(EDIT, post(activity::cleanup_activity)),
        )
        .route(
            "/installations",
            guard(VIEW, get(installations::list_installations)),
        )
        .route(
            "/installations/{ref}",
            guard(VIEW, get(installations::get_installation)),
        )
        .route(
            "/installations/{ref}/begin",
            guard(CONNECT, post(installations::begin_installation)),
        )
        .route(
            "/installations/{ref}/status",
            guard(EDIT, post(installations::update_installation_status)),
        )
        .route(
            "/installations/{ref}/uninstall",
            guard(REVOKE, post(installations::uninstall)),
        )
        .route("/connections", guard(VIEW, get(connections::list_connections)))
        .route(
            "/connections/{ref}",
            guard(VIEW, get(connections::get_connection)),
        )
        .route(
            "/connections/{ref}/begin",
            guard(CONNECT, post(connections::begin_connection)),
        )
        .route(
            "/connections/{ref}/callback",
            guard(CONNECT, get(connections::connection_callback)),
        )
        .route(
            "/connections/{ref}/grants",
            guard(VIEW, get(connections::connection_grants)),
        )
        .route(
            "/connections/{ref}/reconsent/begin",
            guard(RECONSENT, post(connections::reconsent_begin)),
        )
        .route(
            "/connections/{ref}/refresh",
            guard(EDIT, post(connections::refresh_connection)),
        )
        .route(
            "/connections/{ref}/revoke",
            guard(REVOKE, post(connections::revoke_connection)),
        )
        .route(
            "/capabilities/{provider}/{capability}/invoke",
            guard(EDIT, post(capabilities::invoke_capability)),
        )
        .route("/webhooks/{provider}", ingress(post(webhooks::receive_webhook)))
        .route(
            "/subscriptions",
            guard(VIEW, get(subscriptions::list_subscriptions)),
        )
        .route(
            "/subscriptions/{ref}/renew",
            guard(EDIT, post(subscriptions::renew_subscription)),
        )
        .route(
            "/subscriptions/{ref}/cancel",
            guard(EDIT, post(subscriptions::cancel_subscription)),
        )
        .route("/sync/{ref}/run", guard(EDIT, post(sync::run_sync)))
        .route("/sync/{ref}/status", guard(VIEW, get(sync::sync_status)))
        .route("/rate-limits", guard(VIEW, get(status::list_rate_limits)))
        .route(
            "/rate-limits/runtime",
            guard(VIEW, get(status::rate_limit_runtime)),
        )
        .route(
            "/operations/status",
            guard(VIEW, get(status::operations_status)),
        )
        .route(
            "/inbound/{provider}/{surface}",
            ingress(post(webhooks::receive_inbound)),
        )
}

fn workflow_router(state: &AppState) -> Router<AppState> {
    use permissions::*;
    let guard = |permission, route| gated(state, permission, Idempotency::Client, route);

    Router::new()
        .route(
            "/mappings",
            guard(VIEW, get(workflow::list_mappings))
                .merge(guard(EDIT, post(workflow::create_mapping))),
        )
        .route(
            "/mappings/validate",
            guard(VIEW, post(workflow::validate_mapping)),
        )
        .route(
            "/mappings/preview",
            guard(VIEW, post(workflow::preview_mapping)),
        )
        .route(
            "/mappings/spec/{spec_id}",
            guard(VIEW, get(workflow::get_latest_mapping)),
        )
        .route(
            "/mappings/spec/{spec_id}/versions/{version}",
            guard(VIEW, get(workflow::get_mapping_version)),
        )
        .route(
            "/mappings/spec/{spec_id}/update",
            guard(EDIT, post(workflow::update_mapping)),
        )
        .route(
            "/mappings/spec/{spec_id}/validate",
            guard(EDIT, post(workflow::mark_mapping_validated)),
        )
        .route(
            "/mappings/spec/{spec_id}/publish",
            guard(EDIT, post(workflow::publish_mapping)),
        )
        .route(
            "/mappings/spec/{spec_id}/unpublish",
            guard(EDIT, post(workflow::unpublish_mapping)),
        )
        .route("/sync/plan", guard(EDIT, post(workflow::plan_sync)))
        .route("/sync/run", guard(EDIT, post(workflow::run_sync)))
        .route("/sync/runs", guard(VIEW, get(workflow::list_sync_runs)))
        .route("/sync/runs/{run_id}", guard(VIEW, get(workflow::get_sync_run)))
        .route(
            "/sync/runs/{run_id}/resume",
            guard(EDIT, post(workflow::resume_sync_run)),
        )
        .route(
            "/sync/checkpoints/{checkpoint_id}",
            guard(VIEW, get(workflow::get_checkpoint)),
        )
        .route("/sync/conflicts", guard(VIEW, get(workflow::list_conflicts)))
        .route(
            "/sync/conflicts/{conflict_id}",
            guard(VIEW, get(workflow::get_conflict)),
        )
        .route(
            "/sync/conflicts/{conflict_id}/resolve",
            guard(EDIT, post(workflow::resolve_conflict)),
        )
        .route(
            "/sync/schema-drift",
            guard(VIEW, get(workflow::list_schema_drift)),
        )
        .route(
            "/sync/schema-drift/baseline",
            guard(EDIT, post(workflow::capture_baseline)),
        )
        .route(
            "/connection-candidates",
            guard(VIEW, get(workflow::connection_candidates)),
        )
        .route(
            "/capabilities/{provider}/{capability}/invoke",
            guard(EDIT, post(capabilities::invoke_capability)),
        )
        .route(
            "/callbacks/diagnostics/status",
            guard(VIEW, get(workflow::callback_diagnostics)),
        )
        .route(
            "/callbacks/diagnostics/preview",
            guard(VIEW, post(workflow::callback_preview)),
        )
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let protected = Router::new()
        .nest(&state.config.services_base_path(), services_router(&state))
        .nest(WORKFLOW_BASE_PATH, workflow_router(&state))
        .layer(middleware::from_fn_with_state(
            state.config.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .merge(protected)
        .with_state(state)
        .merge(
            SwaggerUi::new("/docs")
                .url("/openapi/services.json", ServicesApiDoc::openapi())
                .url("/openapi/workflow.json", WorkflowApiDoc::openapi()),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(request_context_middleware))
}

/// Dispatch the outbox on an interval, then apply activity retention.
pub fn spawn_background_tasks(state: &AppState, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    let dispatcher = state.dispatcher.clone();
    let activity = state.activity.clone();
    tokio::spawn(async move {
        dispatcher
            .run(shutdown, move || {
                let activity = activity.clone();
                async move {
                    if let Err(err) = activity.enforce_retention().await {
                        tracing::warn!(error = %err, "Activity retention failed");
                    }
                }
            })
            .await;
    })
}

/// Starts the server with the given configuration
pub async fn run_server(config: AppConfig, db: DatabaseConnection) -> anyhow::Result<()> {
    let addr = config.bind_addr().context("invalid server address")?;
    let profile = config.profile.clone();
    let state = AppStateBuilder::new(config, db).build()?;

    let shutdown = CancellationToken::new();
    let background = spawn_background_tasks(&state, shutdown.clone());
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!(%addr, %profile, "Server listening");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Err(err) = background.await {
        tracing::warn!(error = %err, "Background task ended abnormally");
    }
    Ok(())
}

/// OpenAPI document for the services surface
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::readyz,
        crate::handlers::providers::list_providers,
        crate::handlers::activity::list_activity,
        crate::handlers::activity::cleanup_activity,
        crate::handlers::status::services_status,
        crate::handlers::status::operations_status,
        crate::handlers::status::list_rate_limits,
        crate::handlers::status::rate_limit_runtime,
        crate::handlers::status::extension_diagnostics,
        crate::handlers::installations::list_installations,
        crate::handlers::installations::get_installation,
        crate::handlers::installations::begin_installation,
        crate::handlers::installations::update_installation_status,
        crate::handlers::installations::uninstall,
        crate::handlers::connections::list_connections,
        crate::handlers::connections::get_connection,
        crate::handlers::connections::begin_connection,
        crate::handlers::connections::connection_callback,
        crate::handlers::connections::connection_grants,
        crate::handlers::connections::reconsent_begin,
        crate::handlers::connections::refresh_connection,
        crate::handlers::connections::revoke_connection,
        crate::handlers::capabilities::invoke_capability,
        crate::handlers::webhooks::receive_webhook,
        crate::handlers::webhooks::receive_inbound,
        crate::handlers::subscriptions::list_subscriptions,
        crate::handlers::subscriptions::renew_subscription,
        crate::handlers::subscriptions::cancel_subscription,
        crate::handlers::sync::run_sync,
        crate::handlers::sync::sync_status,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::error::ApiError,
            crate::error::ErrorEnvelope,
        )
    ),
    tags(
        (name = "root", description = "Service info and probes"),
        (name = "services", description = "Provider connections, webhooks and lifecycle operations")
    ),
    info(
        title = "Services Plane API",
        description = "Mounted under {admin_api_base}/services",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ServicesApiDoc;

/// OpenAPI document for the workflow surface
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::workflow::list_mappings,
        crate::handlers::workflow::create_mapping,
        crate::handlers::workflow::validate_mapping,
        crate::handlers::workflow::preview_mapping,
        crate::handlers::workflow::get_latest_mapping,
        crate::handlers::workflow::get_mapping_version,
        crate::handlers::workflow::update_mapping,
        crate::handlers::workflow::mark_mapping_validated,
        crate::handlers::workflow::publish_mapping,
        crate::handlers::workflow::unpublish_mapping,
        crate::handlers::workflow::plan_sync,
        crate::handlers::workflow::run_sync,
        crate::handlers::workflow::list_sync_runs,
        crate::handlers::workflow::get_sync_run,
        crate::handlers::workflow::resume_sync_run,
        crate::handlers::workflow::get_checkpoint,
        crate::handlers::workflow::list_conflicts,
        crate::handlers::workflow::get_conflict,
        crate::handlers::workflow::resolve_conflict,
        crate::handlers::workflow::list_schema_drift,
        crate::handlers::workflow::capture_baseline,
        crate::handlers::workflow::connection_candidates,
        crate::handlers::workflow::callback_diagnostics,
        crate::handlers::workflow::callback_preview,
        crate::handlers::capabilities::invoke_capability,
    ),
    components(schemas(crate::error::ApiError, crate::error::ErrorEnvelope)),
    tags((name = "workflow", description = "Mapping specs, sync runs, conflicts and schema drift")),
    servers((url = "/workflow/services")),
    info(
        title = "Services Plane Workflow API",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct WorkflowApiDoc;

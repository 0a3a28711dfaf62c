//! HTTP surface.
//!
//! ```text
//! GET  /health
//! POST /api/user/access                 body + optional X-PAYMENT
//! POST /api/user/invoice
//! GET  /api/user/invoice/:token
//! POST /api/user/invoice/:token/pay     X-PAYMENT
//!
//! bearer key:
//! GET  /api/user/:subject               accounts and live balances
//! GET  /api/servers
//! GET  /api/server/:id
//! GET  /api/channel/:id
//! ```
//!
//! Payment-stage failures answer 402 with the x402 body
//! `{x402Version, error, accepts, payer}`; everything else answers
//! `{success: false, error}` with a status derived from the error kind.

use crate::entitlement::{lookup_catalog, AccessOutcome, AccessRequest, EntitlementEngine, Quote};
use crate::error::{Error, Result};
use crate::invoice::{InvoiceRequest, InvoiceService};
use crate::model::{Resource, ResourceGroup};
use crate::payment::{PaymentRequirement, X402_VERSION};
use crate::pricing::total_price;
use crate::store::Store;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, error, info, warn};

/// Request header carrying the payment proof.
pub const PAYMENT_HEADER: &str = "x-payment";

/// Response header carrying the settlement receipt.
pub const PAYMENT_RESPONSE_HEADER: &str = "x-payment-response";

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    engine: EntitlementEngine,
    invoices: InvoiceService,
    store: Arc<dyn Store>,
    api_key: Option<Arc<str>>,
}

impl ApiState {
    /// Bundle the services the handlers need. Without an `api_key` the
    /// bearer-protected routes refuse every request.
    #[must_use]
    pub fn new(
        engine: EntitlementEngine,
        invoices: InvoiceService,
        store: Arc<dyn Store>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            engine,
            invoices,
            store,
            api_key: api_key.filter(|k| !k.is_empty()).map(Arc::from),
        }
    }
}

/// Build the router.
pub fn router(state: ApiState) -> Router {
    let protected = Router::new()
        .route("/api/user/:subject", get(user_accounts))
        .route("/api/servers", get(list_groups))
        .route("/api/server/:id", get(get_group))
        .route("/api/channel/:id", get(get_resource))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/api/user/access", post(request_access))
        .route("/api/user/invoice", post(create_invoice))
        .route("/api/user/invoice/:token", get(invoice_details))
        .route("/api/user/invoice/:token/pay", post(pay_invoice))
        .merge(protected)
        .with_state(state)
}

/// HTTP status for an error outside the payment stage.
#[must_use]
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::BadRequest(_)
        | Error::MalformedProof(_)
        | Error::InvalidPrice(_)
        | Error::InsufficientBalance { .. } => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Conflict(_) => StatusCode::CONFLICT,
        Error::PaymentRequired
        | Error::VerificationRejected { .. }
        | Error::SettlementFailed { .. }
        | Error::SettlementAmbiguous { .. } => StatusCode::PAYMENT_REQUIRED,
        Error::FacilitatorUnavailable(_)
        | Error::AuthorityUnavailable(_)
        | Error::BalanceUnavailable(_)
        | Error::ProvisioningFailed(_)
        | Error::Network(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Config(_)
        | Error::Storage(_)
        | Error::Io(_)
        | Error::Serialization(_)
        | Error::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &Error) -> Response {
    let status = status_for(err);
    let message = if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
        error!("Request failed: {err}");
        "Internal server error".to_string()
    } else {
        debug!("Request refused ({status}): {err}");
        err.to_string()
    };
    (
        status,
        Json(json!({ "success": false, "error": message, "kind": err.kind() })),
    )
        .into_response()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PaymentRequiredBody<'a> {
    x402_version: u8,
    error: String,
    accepts: &'a [PaymentRequirement],
    #[serde(skip_serializing_if = "Option::is_none")]
    payer: Option<&'a str>,
}

fn payment_required(err: &Error, accepts: &[PaymentRequirement]) -> Response {
    info!("Payment not completed: {err}");
    let body = PaymentRequiredBody {
        x402_version: X402_VERSION,
        error: err.to_string(),
        accepts,
        payer: err.payer(),
    };
    (StatusCode::PAYMENT_REQUIRED, Json(body)).into_response()
}

fn payment_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(PAYMENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn required<T>(value: Option<T>, name: &str) -> Result<T> {
    value.ok_or_else(|| Error::BadRequest(format!("{name} is required")))
}

fn json_body<T>(body: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    body.map(|Json(b)| b)
        .map_err(|e| Error::BadRequest(format!("invalid JSON body: {}", e.body_text())))
}

/// Token of an `Authorization: Bearer <token>` header.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

async fn require_api_key(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    let authorized = match (state.api_key.as_deref(), bearer_token(request.headers())) {
        (Some(expected), Some(token)) => {
            bool::from(expected.as_bytes().ct_eq(token.as_bytes()))
        }
        _ => false,
    };

    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "success": false, "error": "Unauthorized" })),
        )
            .into_response();
    }
    next.run(request).await
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Body of `POST /api/user/access`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessBody {
    #[serde(alias = "discordId")]
    subject: Option<String>,
    #[serde(alias = "networkId")]
    network: Option<String>,
    #[serde(alias = "serverId")]
    group: Option<String>,
    #[serde(alias = "channelId")]
    resource: Option<String>,
    #[serde(alias = "roleApplicableTime")]
    duration: Option<u64>,
}

impl AccessBody {
    fn into_request(self) -> Result<AccessRequest> {
        let request = AccessRequest {
            subject: required(self.subject, "subject")?,
            network: required(self.network, "network")?,
            group: required(self.group, "group")?,
            resource: required(self.resource, "resource")?,
            duration: required(self.duration, "duration")?,
        };
        request.validate()?;
        Ok(request)
    }
}

/// Fulfil a quote, mapping payment-stage failures to 402.
async fn fulfil(engine: &EntitlementEngine, quote: Quote, headers: &HeaderMap) -> Response {
    let accepts = quote.accepts().to_vec();
    match engine.fulfil(quote, payment_header(headers)).await {
        Ok(outcome) => granted(&outcome),
        Err(e) if e.is_payment_failure() => payment_required(&e, &accepts),
        Err(e) => error_response(&e),
    }
}

fn granted(outcome: &AccessOutcome) -> Response {
    let body = json!({
        "success": true,
        "expiresAt": outcome.grant.expires_at,
        "attached": outcome.grant.attached,
        "transaction": outcome.settlement.as_ref().map(|s| s.response.transaction.as_str()),
    });
    let mut response = (StatusCode::OK, Json(body)).into_response();

    if let Some(settlement) = &outcome.settlement {
        match settlement
            .response_header()
            .map(|h| HeaderValue::from_str(&h))
        {
            Ok(Ok(value)) => {
                response
                    .headers_mut()
                    .insert(PAYMENT_RESPONSE_HEADER, value);
            }
            Ok(Err(e)) => warn!("Settlement receipt is not a valid header: {e}"),
            Err(e) => warn!("Could not encode settlement receipt: {e}"),
        }
    }
    response
}

async fn request_access(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: std::result::Result<Json<AccessBody>, JsonRejection>,
) -> Response {
    let request = match json_body(body).and_then(AccessBody::into_request) {
        Ok(request) => request,
        Err(e) => return error_response(&e),
    };
    let quote = match state.engine.quote(&request).await {
        Ok(quote) => quote,
        Err(e) => return error_response(&e),
    };
    fulfil(&state.engine, quote, &headers).await
}

/// Body of `POST /api/user/invoice`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvoiceBody {
    #[serde(alias = "discordId")]
    subject: Option<String>,
    #[serde(alias = "serverId")]
    group: Option<String>,
    #[serde(alias = "channelId")]
    resource: Option<String>,
    #[serde(alias = "roleApplicableTime")]
    duration: Option<u64>,
}

impl InvoiceBody {
    fn into_request(self) -> Result<InvoiceRequest> {
        Ok(InvoiceRequest {
            subject: required(self.subject, "subject")?,
            group: required(self.group, "group")?,
            resource: required(self.resource, "resource")?,
            duration: required(self.duration, "duration")?,
        })
    }
}

async fn create_invoice(
    State(state): State<ApiState>,
    body: std::result::Result<Json<InvoiceBody>, JsonRejection>,
) -> Response {
    let result = async {
        let request = json_body(body).and_then(InvoiceBody::into_request)?;
        state.invoices.create_invoice(&request).await
    }
    .await;

    match result {
        Ok(invoice) => Json(json!({ "success": true, "token": invoice.token })).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn invoice_details(State(state): State<ApiState>, Path(token): Path<String>) -> Response {
    let result = async {
        let details = state.invoices.resolve_invoice(&token).await?;
        let (_, resource) = lookup_catalog(
            state.store.as_ref(),
            &details.group,
            &details.resource,
            details.duration,
        )
        .await?;
        let price = total_price(
            resource.price_per_unit,
            details.duration,
            resource.price_unit_seconds,
        )?;
        Ok::<_, Error>(json!({
            "success": true,
            "invoice": {
                "token": token,
                "subject": details.subject,
                "group": details.group,
                "resource": details.resource,
                "duration": details.duration,
                "network": state.engine.settings().default_network,
                "price": price.to_string(),
            }
        }))
    }
    .await;

    match result {
        Ok(body) => Json(body).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn pay_invoice(
    State(state): State<ApiState>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Response {
    match state.engine.quote_invoice(&token).await {
        Ok(quote) => fulfil(&state.engine, quote, &headers).await,
        Err(e) => error_response(&e),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AccountView {
    network: String,
    address: String,
    /// `None` when the ledger could not be read.
    balance: Option<String>,
}

async fn user_accounts(State(state): State<ApiState>, Path(subject): Path<String>) -> Response {
    if subject.trim().is_empty() {
        return error_response(&Error::BadRequest("subject is required".to_string()));
    }

    let mut accounts = Vec::new();
    for network in state.engine.registry().networks() {
        let account = match state.engine.accounts().ensure_account(&subject, &network.id).await {
            Ok(account) => account,
            Err(e) => return error_response(&e),
        };
        let balance = match state
            .engine
            .balances()
            .get_balance(&network.id, account.address())
            .await
        {
            Ok(balance) => Some(balance.to_string()),
            Err(e) => {
                debug!("Balance of {} on {}: {e}", account.address(), network.id);
                None
            }
        };
        accounts.push(AccountView {
            network: network.id.clone(),
            address: account.keys.public_address,
            balance,
        });
    }
    Json(json!({ "success": true, "accounts": accounts })).into_response()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResourceView {
    id: String,
    group: String,
    capability: String,
    price_per_unit: String,
    price_unit_seconds: u64,
    allowed_durations: Vec<u64>,
}

impl From<Resource> for ResourceView {
    fn from(resource: Resource) -> Self {
        Self {
            id: resource.id,
            group: resource.group,
            capability: resource.capability,
            price_per_unit: resource.price_per_unit.to_string(),
            price_unit_seconds: resource.price_unit_seconds,
            allowed_durations: resource.allowed_durations.into_iter().collect(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GroupView {
    id: String,
    receivers: BTreeMap<String, String>,
    default_resource: Option<String>,
    resource_count: usize,
    resources: Vec<ResourceView>,
}

async fn group_view(store: &dyn Store, group: ResourceGroup) -> Result<GroupView> {
    let resources: Vec<ResourceView> = store
        .resources_in(&group.id)
        .await?
        .into_iter()
        .map(ResourceView::from)
        .collect();
    Ok(GroupView {
        id: group.id,
        receivers: group.receivers,
        default_resource: group.default_resource,
        resource_count: resources.len(),
        resources,
    })
}

async fn list_groups(State(state): State<ApiState>) -> Response {
    let result = async {
        let mut views = Vec::new();
        for group in state.store.groups().await? {
            views.push(group_view(state.store.as_ref(), group).await?);
        }
        Ok::<_, Error>(views)
    }
    .await;

    match result {
        Ok(servers) => Json(json!({ "success": true, "servers": servers })).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn get_group(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let result = async {
        let group = state
            .store
            .group(&id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("group '{id}'")))?;
        group_view(state.store.as_ref(), group).await
    }
    .await;

    match result {
        Ok(server) => Json(json!({ "success": true, "server": server })).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn get_resource(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let result = async {
        let resource = state
            .store
            .resource(&id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("resource '{id}'")))?;
        let receivers = state
            .store
            .group(&resource.group)
            .await?
            .map(|g| g.receivers)
            .unwrap_or_default();
        Ok::<_, Error>((ResourceView::from(resource), receivers))
    }
    .await;

    match result {
        Ok((channel, receivers)) => Json(json!({
            "success": true,
            "channel": channel,
            "receivers": receivers,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

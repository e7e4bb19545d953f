//! Representative tenant handlers.
//!
//! Real feature modules (full CRUD services, their UIs) live outside
//! this repository; these handlers are the dispatch targets that prove
//! the pipeline bindings: statements run through the schema-pinned
//! client, side effects go through the sandbox providers, and the
//! response uses the tenant envelope.

use std::sync::Arc;

use anyhow::anyhow;
use hyper::{Body, Method, Request, Response, StatusCode};
use preview_api::models::{ApiResponse, ResolvedSession};
use serde_json::json;
use utils::http::error::ApiError;
use utils::http::json::json_response;
use utils::http::request::get_query_param;
use utils::token::SessionToken;

use crate::db::SchemaClient;
use crate::sandbox::email::EmailProvider;
use crate::sandbox::SandboxProviders;

/// Everything the pipeline binds for one admitted tenant request.
pub struct TenantContext {
    pub token: SessionToken,
    pub session: ResolvedSession,
    pub client: Arc<SchemaClient>,
    pub sandbox: Arc<SandboxProviders>,
}

pub async fn dispatch(
    ctx: TenantContext,
    request: Request<Body>,
) -> Result<Response<Body>, ApiError> {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();

    if method == Method::GET && path == "/api/v1/session" {
        session_info(ctx)
    } else if method == Method::GET && path.starts_with("/api/v1/ecommerce/products") {
        collection_summary(ctx, "products").await
    } else if method == Method::GET && path.starts_with("/api/v1/ecommerce/cart") {
        collection_summary(ctx, "carts").await
    } else if method == Method::POST && path == "/api/v1/ecommerce/checkout" {
        checkout(ctx).await
    } else if method == Method::GET && path.starts_with("/api/v1/booking/services") {
        collection_summary(ctx, "services").await
    } else if method == Method::POST && path == "/api/v1/files" {
        upload_file(ctx, request).await
    } else {
        Err(ApiError::NotFound(anyhow!("no handler for {path}")))
    }
}

/// Core route: echo the entitlements of the calling session.
fn session_info(ctx: TenantContext) -> Result<Response<Body>, ApiError> {
    json_response(
        StatusCode::OK,
        ApiResponse::ok(json!({
            "selectedFeatures": ctx.session.selected_features,
            "tier": ctx.session.tier,
            "expiresAt": ctx.session.expires_at,
        })),
    )
}

/// Count rows in one of the seeded tables through the schema-pinned
/// client. The table name comes from the dispatch table above, never
/// from the request.
async fn collection_summary(
    ctx: TenantContext,
    table: &'static str,
) -> Result<Response<Body>, ApiError> {
    let row = ctx
        .client
        .client()
        .query_one(&format!("SELECT count(*) FROM {table}"), &[])
        .await
        .map_err(|e| ApiError::InternalServerError(e.into()))?;
    let count: i64 = row.get(0);

    json_response(
        StatusCode::OK,
        ApiResponse::ok(json!({ "collection": table, "count": count })),
    )
}

/// Checkout walks the whole sandbox: totals from the session schema,
/// payment and confirmation email through the mock providers, order row
/// back into the schema.
async fn checkout(ctx: TenantContext) -> Result<Response<Body>, ApiError> {
    let client = ctx.client.client();

    let row = client
        .query_one(
            "SELECT COALESCE(SUM(p.price_cents * ci.quantity), 0)::BIGINT \
             FROM cart_items ci JOIN products p ON p.id = ci.product_id",
            &[],
        )
        .await
        .map_err(|e| ApiError::InternalServerError(e.into()))?;
    let total_cents: i64 = row.get(0);

    let checkout = ctx
        .sandbox
        .payment
        .create_checkout_session(total_cents, "USD")
        .await
        .map_err(ApiError::InternalServerError)?;
    let payment = ctx
        .sandbox
        .payment
        .confirm_payment(&checkout.id)
        .await
        .map_err(ApiError::InternalServerError)?;

    let order = client
        .query_one(
            "INSERT INTO orders (total_cents, state) VALUES ($1, 'paid') RETURNING id",
            &[&total_cents],
        )
        .await
        .map_err(|e| ApiError::InternalServerError(e.into()))?;
    let order_id: i64 = order.get(0);

    let email_id = ctx
        .sandbox
        .email
        .send_email(
            "customer@preview.invalid",
            "Order confirmation",
            &format!("Order #{order_id} paid: {total_cents} cents"),
            Some(&ctx.token),
        )
        .await
        .map_err(ApiError::InternalServerError)?;

    json_response(
        StatusCode::OK,
        ApiResponse::ok(json!({
            "orderId": order_id,
            "totalCents": total_cents,
            "checkoutId": checkout.id,
            "paymentId": payment.id,
            "confirmationEmailId": email_id,
        })),
    )
}

/// Core route exercising the storage stub: accept bytes, hand back the
/// synthetic key and URL.
async fn upload_file(
    ctx: TenantContext,
    mut request: Request<Body>,
) -> Result<Response<Body>, ApiError> {
    let name = get_query_param(&request, "name")?
        .unwrap_or("upload.bin")
        .to_owned();
    let bytes = hyper::body::to_bytes(request.body_mut())
        .await
        .map_err(|e| ApiError::BadRequest(anyhow!("failed to read upload body: {e}")))?;

    let stored = ctx
        .sandbox
        .storage
        .upload_file(&bytes, &name)
        .await
        .map_err(ApiError::InternalServerError)?;
    let signed_url = ctx
        .sandbox
        .storage
        .get_signed_url(&stored.key)
        .await
        .map_err(ApiError::InternalServerError)?;

    json_response(
        StatusCode::OK,
        ApiResponse::ok(json!({
            "key": stored.key,
            "url": stored.url,
            "signedUrl": signed_url,
        })),
    )
}

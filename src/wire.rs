use std::io;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::auth::PasswordAuth;
use crate::command::{self, CommandError, Request, Timestamp};
use crate::engine::{AvailabilityQuery, Engine, EngineError, RentalRequest};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::observability;
use crate::store::DurableStore;

const ENCODE_FAILED: &str = concat!(
    r#"{"ok":false,"error":{"kind":"INTERNAL","status":500,"#,
    r#""reason":"failed to encode reply","conflicts":[]}}"#
);

#[derive(Serialize)]
struct ErrorBody<'a> {
    kind: &'static str,
    status: u16,
    reason: &'a str,
    conflicts: &'a [ConflictingReservation],
}

/// One response line: `{"ok":true,"data":…}` or `{"ok":false,"error":…}`.
#[derive(Serialize)]
struct Reply<'a> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody<'a>>,
}

impl<'a> Reply<'a> {
    fn ok(data: Value) -> Self {
        Self { ok: true, data: Some(data), error: None }
    }

    fn failure(
        kind: &'static str,
        status: u16,
        reason: &'a str,
        conflicts: &'a [ConflictingReservation],
    ) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ErrorBody { kind, status, reason, conflicts }),
        }
    }

    fn engine_error(e: &'a EngineError) -> Self {
        let kind = e.kind();
        Self::failure(kind.code(), kind.status(), e.reason(), e.conflicts())
    }

    fn unauthenticated(reason: &'a str) -> Self {
        Self::failure("UNAUTHENTICATED", 401, reason, &[])
    }

    fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            warn!("failed to encode reply: {e}");
            ENCODE_FAILED.to_string()
        })
    }
}

fn to_data<T: Serialize>(value: T) -> Result<Value, EngineError> {
    serde_json::to_value(value).map_err(|e| EngineError::Internal(format!("encode failed: {e}")))
}

fn codec_error(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        LinesCodecError::MaxLineLengthExceeded => {
            io::Error::new(io::ErrorKind::InvalidData, "request line too long")
        }
    }
}

/// Serve one client until it disconnects or fails authentication.
///
/// Requests are newline-delimited JSON, answered in order. The first request
/// must be `auth`; anything else before it is refused without being run.
pub async fn process_connection<S>(
    socket: S,
    engine: Arc<Engine>,
    store: Arc<DurableStore>,
    password: String,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let auth = PasswordAuth::new(password);
    let mut authenticated = false;

    while let Some(frame) = framed.next().await {
        let line = match frame {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                let reply = Reply::failure("INVALID_ARGUMENT", 400, "request line too long", &[]);
                framed.send(reply.to_line()).await.map_err(codec_error)?;
                return Ok(());
            }
            Err(LinesCodecError::Io(e)) => return Err(e),
        };

        let started = Instant::now();
        let request = match command::parse_request(&line) {
            Ok(request) => request,
            Err(CommandError::Empty) => continue,
            Err(e) => {
                let e = EngineError::invalid(e.to_string());
                framed.send(Reply::engine_error(&e).to_line()).await.map_err(codec_error)?;
                continue;
            }
        };
        let op = observability::op_label(&request);

        if let Request::Auth { password } = &request {
            if auth.verify(password) {
                authenticated = true;
                debug!("client authenticated");
                framed
                    .send(Reply::ok(json!({ "authenticated": true })).to_line())
                    .await
                    .map_err(codec_error)?;
                record(op, "ok", started);
                continue;
            }
            framed
                .send(Reply::unauthenticated("password authentication failed").to_line())
                .await
                .map_err(codec_error)?;
            record(op, "unauthenticated", started);
            return Ok(());
        }
        if !authenticated {
            framed
                .send(Reply::unauthenticated("authenticate first").to_line())
                .await
                .map_err(codec_error)?;
            record(op, "unauthenticated", started);
            continue;
        }

        let outcome = execute(request, &engine, &store).await;
        let (line, status) = match &outcome {
            Ok(data) => (Reply::ok(data.clone()).to_line(), "ok"),
            Err(e) => {
                debug!("{op} failed: {e}");
                (Reply::engine_error(e).to_line(), e.kind().as_str())
            }
        };
        framed.send(line).await.map_err(codec_error)?;
        record(op, status, started);
    }
    Ok(())
}

fn record(op: &'static str, status: &'static str, started: Instant) {
    metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
}

fn created(id: Ulid) -> Value {
    json!({ "id": id })
}

async fn execute(
    request: Request,
    engine: &Engine,
    store: &DurableStore,
) -> Result<Value, EngineError> {
    match request {
        Request::Auth { .. } => Ok(json!({ "authenticated": true })),

        Request::GetAvailableDates { product_id, start_date, end_date, include_hours } => {
            let query = AvailabilityQuery { start_date, end_date, include_hours };
            to_data(engine.get_available_dates(product_id, query).await?)
        }
        Request::GetAvailableHours { product_id, date } => {
            let hours = engine.get_available_hours(product_id, date).await?;
            Ok(json!({ "date": date, "hours": hours }))
        }
        Request::CheckAvailability { product_id, start, end } => {
            to_data(engine.check_availability(product_id, Timestamp::window(start, end)).await?)
        }
        Request::CalculatePrice { product_id, user_id, start, end, charging_type } => {
            let quote = engine
                .calculate_price(product_id, Timestamp::window(start, end), charging_type, user_id)
                .await?;
            to_data(quote)
        }
        Request::CreateRentalRequest { user_id, product_id, start, end, charging_type } => {
            let span = Timestamp::window(start, end);
            let request = RentalRequest { product_id, span, charging_type };
            to_data(engine.create_rental_request(user_id, request).await?)
        }
        Request::ConfirmRental { rental_id, decision } => {
            to_data(engine.confirm_rental(rental_id, decision).await?)
        }
        Request::GetReservation { id } => to_data(engine.get_reservation(id).await?),

        Request::RegisterCompany { id, name } => {
            let id = id.unwrap_or_else(Ulid::new);
            store.register_company(id, name).await?;
            info!("company {id} registered");
            Ok(created(id))
        }
        Request::RegisterClient { id, name, email } => {
            let id = id.unwrap_or_else(Ulid::new);
            store.register_client(id, name, email).await?;
            Ok(created(id))
        }
        Request::LinkAssociate { user_id, company_id } => {
            store.link_associate(user_id, company_id).await?;
            Ok(json!({ "user_id": user_id, "company_id": company_id }))
        }
        Request::RegisterProduct { id, company_id, name, description, pricing } => {
            let id = id.unwrap_or_else(Ulid::new);
            store.register_product(id, company_id, name, description, pricing).await?;
            info!("product {id} registered for company {company_id}");
            Ok(created(id))
        }
        Request::DeleteProduct { id } => {
            store.delete_product(id, engine.now_ms()).await?;
            info!("product {id} deleted");
            Ok(created(id))
        }
        Request::SetWeeklySchedule { product_id, slots } => {
            let days = slots.len();
            store.set_weekly_schedule(product_id, slots).await?;
            Ok(json!({ "product_id": product_id, "days": days }))
        }
        Request::AddDateOverride {
            product_id,
            id,
            start_date,
            end_date,
            is_available,
            price_override,
        } => {
            let entry = DateOverride {
                id: id.unwrap_or_else(Ulid::new),
                start_date,
                end_date,
                is_available,
                price_override,
            };
            let id = entry.id;
            store.add_date_override(product_id, entry).await?;
            Ok(created(id))
        }
        Request::RemoveDateOverride { product_id, id } => {
            store.remove_date_override(product_id, id).await?;
            Ok(created(id))
        }
    }
}

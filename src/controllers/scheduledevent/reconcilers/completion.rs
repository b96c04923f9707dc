use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tracing::*;

use super::children::release_children;
use crate::controllers::Context;
use crate::reconcilers::timestamps;
use crate::resources::accesscodes::OneTimeAccessCode;
use crate::resources::scheduledevents::ScheduledEvent;
use crate::resources::sessions::Session;
use crate::resources::{ACCESS_CODE_LABEL, SCHEDULED_EVENT_LABEL};
use crate::runtime::retry::update_status_with_retry;
use crate::store::{labels_selector, ObjectStore};
use crate::Result;

/// Tears down everything an ended event provisioned and ends the sessions started through it
pub async fn complete<S: ObjectStore>(
    ctx: &Context<S>,
    se: &ScheduledEvent,
    now: DateTime<Utc>,
) -> Result<()> {
    release_children(ctx, se, true).await?;

    let ns = ctx.namespace();
    let se_name = se.name_any();
    let mut codes = vec![se.spec.access_code.clone()];
    codes.extend(
        ctx.store
            .list::<OneTimeAccessCode>(ns, &labels_selector([(SCHEDULED_EVENT_LABEL, se_name.as_str())]))
            .await?
            .iter()
            .map(ResourceExt::name_any),
    );

    for code in codes.iter().filter(|c| !c.is_empty()) {
        let sessions: Vec<Session> = ctx
            .store
            .list(ns, &labels_selector([(ACCESS_CODE_LABEL, code.as_str())]))
            .await?;
        for session in sessions.iter().filter(|s| !s.is_finished()) {
            end_session(ctx, &session.name_any(), now).await?;
        }
    }
    Ok(())
}

/// Moves the expiration of a running session to `now` so it gets finalised
async fn end_session<S: ObjectStore>(
    ctx: &Context<S>,
    name: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let result = update_status_with_retry::<Session, _, _>(&ctx.store, ctx.namespace(), name, |session| {
        if session.is_finished() {
            return false;
        }
        let already_expired = session.expiration().ok().flatten().is_some_and(|e| e <= now);
        let status = session.status.get_or_insert_with(Default::default);
        if already_expired && !status.active {
            return false;
        }
        if !already_expired {
            status.expiration_time = timestamps::format(now);
        }
        status.active = false;
        true
    })
    .await;

    match result {
        Ok(_) => {
            debug!("Ended Session {name}");
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

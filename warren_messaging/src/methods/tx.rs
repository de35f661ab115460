//! Publisher confirms and transactions. The two modes are mutually
//! exclusive on a channel: confirms acknowledge each publish as it is
//! persisted, transactions buffer publishes and acks until commit.

use std::ops::Not;

use warren_core::{
    connection::{Channel, ChannelMode, TxState},
    error::ChannelException,
    methods::{
        ConfirmSelect, ConfirmSelectOk, Method, TxCommitOk, TxRollbackOk, TxSelectOk,
    },
};

use crate::{
    methods::{ack, publish, MethodResponse},
    server::Broker,
};

pub(crate) fn confirm_select(channel: &Channel, select: ConfirmSelect) -> MethodResponse {
    {
        let mut state = channel.state();
        match state.mode {
            ChannelMode::Tx(_) => return Err(ChannelException::PreconditionFailed.into()),
            ChannelMode::Confirm { .. } => {}
            ChannelMode::Normal => state.mode = ChannelMode::Confirm { next_publish_seq: 1 },
        }
    }
    Ok(select
        .no_wait
        .not()
        .then(|| Method::ConfirmSelectOk(ConfirmSelectOk)))
}

pub(crate) fn select(channel: &Channel) -> MethodResponse {
    let mut state = channel.state();
    match state.mode {
        ChannelMode::Confirm { .. } => return Err(ChannelException::NotAllowed.into()),
        ChannelMode::Tx(_) => {}
        ChannelMode::Normal => state.mode = ChannelMode::Tx(TxState::default()),
    }
    Ok(Some(Method::TxSelectOk(TxSelectOk)))
}

/// Drains the buffered publishes and acks of the channel's transaction in
/// one go: publishes are routed first, then the settlements apply.
pub(crate) fn commit(broker: &Broker, channel: &Channel) -> MethodResponse {
    let (publishes, settlements) = {
        let mut state = channel.state();
        let tx = match &mut state.mode {
            ChannelMode::Tx(tx) => std::mem::take(tx),
            _ => return Err(ChannelException::PreconditionFailed.into()),
        };

        let mut settlements = Vec::new();
        for pending in tx.pending_acks {
            // tags were validated when buffered; one swallowed by a
            // concurrent recover or queue delete is simply spent
            if let Ok(entries) = state.take_settled(pending.delivery_tag, pending.multiple) {
                settlements.push((entries, pending.outcome));
            }
        }
        (tx.pending_publishes, settlements)
    };

    for message in publishes {
        publish::route_and_deliver(broker, channel, &message)?;
    }
    for (entries, outcome) in settlements {
        ack::apply_settlement(broker, &channel.vhost, entries, outcome)?;
    }

    Ok(Some(Method::TxCommitOk(TxCommitOk)))
}

/// Discards buffered publishes and undoes buffered acks by requeuing the
/// deliveries they referenced.
pub(crate) fn rollback(broker: &Broker, channel: &Channel) -> MethodResponse {
    let mut settled = {
        let mut state = channel.state();
        let tx = match &mut state.mode {
            ChannelMode::Tx(tx) => std::mem::take(tx),
            _ => return Err(ChannelException::PreconditionFailed.into()),
        };

        let mut settled = Vec::new();
        for pending in tx.pending_acks {
            if let Ok(entries) = state.take_settled(pending.delivery_tag, pending.multiple) {
                settled.extend(entries);
            }
        }
        settled
    };

    // acks may have been buffered out of tag order; requeue in delivery order
    settled.sort_by_key(|(tag, _)| *tag);
    ack::requeue_deliveries(broker, &channel.vhost, settled)?;

    Ok(Some(Method::TxRollbackOk(TxRollbackOk)))
}

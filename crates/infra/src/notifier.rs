//! Outbound notices for the external notifier and dispatch subsystem.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use procura_core::Money;
use procura_events::EventBus;
use procura_purchasing::{GroupedOrderId, SupplierOrderId, SupplierOrderItem};
use procura_requests::MaterialRequestId;
use procura_suppliers::SupplierId;

/// Something a human or a downstream system should hear about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum ProcurementNotice {
    ThresholdReached {
        grouped_order_id: GroupedOrderId,
        supplier_id: SupplierId,
        order_number: String,
        amount: Money,
        threshold: Money,
    },
    ValidatedBelowThreshold {
        grouped_order_id: GroupedOrderId,
        supplier_id: SupplierId,
        amount: Money,
        threshold: Money,
        validated_by: String,
    },
    /// A finalized supplier order, ready for transmission.
    SupplierOrderReady {
        supplier_order_id: SupplierOrderId,
        grouped_order_id: GroupedOrderId,
        supplier_id: SupplierId,
        order_number: String,
        total_amount: Money,
        items: Vec<SupplierOrderItem>,
    },
    OverDelivery {
        supplier_order_id: SupplierOrderId,
        line_no: u32,
        received: u32,
        excess: u32,
    },
    LineUnresolvable {
        request_id: MaterialRequestId,
        line_no: u32,
        reason: String,
    },
}

impl ProcurementNotice {
    pub fn kind(&self) -> &'static str {
        match self {
            ProcurementNotice::ThresholdReached { .. } => "threshold_reached",
            ProcurementNotice::ValidatedBelowThreshold { .. } => "validated_below_threshold",
            ProcurementNotice::SupplierOrderReady { .. } => "supplier_order_ready",
            ProcurementNotice::OverDelivery { .. } => "over_delivery",
            ProcurementNotice::LineUnresolvable { .. } => "line_unresolvable",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotifyError {
    #[error("notice was not delivered: {0}")]
    Undelivered(String),
}

/// Consumer of [`ProcurementNotice`]s.
///
/// `Ok` means the notice was accepted; for threshold alerts that is what flips
/// `threshold_alert_sent`.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: ProcurementNotice) -> Result<(), NotifyError>;
}

impl<N> Notifier for std::sync::Arc<N>
where
    N: Notifier + ?Sized,
{
    fn notify(&self, notice: ProcurementNotice) -> Result<(), NotifyError> {
        (**self).notify(notice)
    }
}

/// Publishes notices on an [`EventBus`].
#[derive(Debug)]
pub struct BusNotifier<B> {
    bus: B,
}

impl<B> BusNotifier<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

impl<B> Notifier for BusNotifier<B>
where
    B: EventBus<ProcurementNotice>,
{
    fn notify(&self, notice: ProcurementNotice) -> Result<(), NotifyError> {
        self.bus
            .publish(notice)
            .map_err(|e| NotifyError::Undelivered(format!("{e:?}")))
    }
}

//! Topic catalogue of the checkout saga.

use serde::{Deserialize, Serialize};

use crate::EventBusError;

/// A topic on the event bus, named after the domain fact it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// An order was created in Pending state. Starts the saga.
    #[serde(rename = "orders.created")]
    OrdersCreated,
    /// Payment for an order was authorized (or is collected on delivery).
    #[serde(rename = "payment.succeeded")]
    PaymentSucceeded,
    /// Payment for an order was rejected.
    #[serde(rename = "payment.failed")]
    PaymentFailed,
    /// Stock for every line of an order was reserved.
    #[serde(rename = "stock.reserved")]
    StockReserved,
    /// Stock could not be reserved for an order.
    #[serde(rename = "stock.reservation.failed")]
    StockReservationFailed,
    /// An order reached a successful terminal state.
    #[serde(rename = "orders.confirmed")]
    OrdersConfirmed,
    /// A user registered. Consumed by notification only.
    #[serde(rename = "users.registered")]
    UsersRegistered,
}

impl Topic {
    /// Every topic, in saga order.
    pub const ALL: [Topic; 7] = [
        Topic::OrdersCreated,
        Topic::PaymentSucceeded,
        Topic::PaymentFailed,
        Topic::StockReserved,
        Topic::StockReservationFailed,
        Topic::OrdersConfirmed,
        Topic::UsersRegistered,
    ];

    /// Returns the wire name of the topic.
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::OrdersCreated => "orders.created",
            Topic::PaymentSucceeded => "payment.succeeded",
            Topic::PaymentFailed => "payment.failed",
            Topic::StockReserved => "stock.reserved",
            Topic::StockReservationFailed => "stock.reservation.failed",
            Topic::OrdersConfirmed => "orders.confirmed",
            Topic::UsersRegistered => "users.registered",
        }
    }

    /// Returns the consumer group name a service uses for this topic.
    ///
    /// Every service gets its own group per topic, so each one sees every
    /// message while instances of the same service share the partitions.
    pub fn consumer_group(&self, service: &str) -> String {
        format!("{service}-{}", self.as_str())
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Topic {
    type Err = EventBusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|topic| topic.as_str() == s)
            .ok_or_else(|| EventBusError::UnknownTopic(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_parse_back() {
        for topic in Topic::ALL {
            assert_eq!(topic.as_str().parse::<Topic>().unwrap(), topic);
        }
    }

    #[test]
    fn unknown_topic_is_rejected() {
        let err = "orders.deleted".parse::<Topic>().unwrap_err();
        assert!(matches!(err, EventBusError::UnknownTopic(name) if name == "orders.deleted"));
    }

    #[test]
    fn consumer_group_is_service_and_topic() {
        assert_eq!(
            Topic::StockReserved.consumer_group("order-service"),
            "order-service-stock.reserved"
        );
    }

    #[test]
    fn serde_uses_wire_name() {
        let json = serde_json::to_string(&Topic::StockReservationFailed).unwrap();
        assert_eq!(json, "\"stock.reservation.failed\"");
    }
}

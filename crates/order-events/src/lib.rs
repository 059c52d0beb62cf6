pub mod bus;
pub mod events;
pub mod traits;

pub use bus::{DEFAULT_HISTORY_CAPACITY, EventBus, SubscriptionId};
pub use events::{
    CustomerInfo, DeliveryAddress, DeliveryType, DriverAssignedData, DriverInfo, EventMetadata,
    EventType, KdsEventData, KdsStage, OrderCreatedData, OrderItem, OrderStatusChangedData,
    PaymentMethod, PaymentStatus, StatusCustomer, DEFAULT_SOURCE, WEBHOOK_VERSION, WebhookEvent,
    event_type_for_status,
};
pub use traits::{EventError, EventListener, FnListener, listener_fn};

pub mod controller;
pub mod path;
pub mod store;
pub mod validation;
pub mod value;


pub use controller::{
    FieldInfo, FieldInstanceId, FormController, FormError, FormOptions, FormResult,
    InvalidSubmitFn, SetValueOptions, SubmitEvent, SubmitHandlerFn, ValidationTrigger,
};
pub use path::{FieldPath, PathError, PathSegment, get_value, set_value};
pub use store::{FieldMeta, FormState, FormStore, SubscriptionId};
pub use validation::{
    BoxedValidateFuture, FieldInstance, FormValidatorFn, ValidationError, ValidationMeta,
    ValidationOutcome, ValidationTicket,
};
pub use value::Value;

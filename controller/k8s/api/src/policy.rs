pub mod header_propagation_policy;

pub use self::header_propagation_policy::{
    HeaderPropagationPolicy, HeaderPropagationPolicySpec, HeaderPropagationPolicyStatus,
    PolicyHeader, PropagationRule,
};

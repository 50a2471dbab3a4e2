#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub use shaper_common::constants;
pub use shaper_limiter::*;
pub use shaper_wire::control;

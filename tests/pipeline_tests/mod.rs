//! Pipeline integration stories
//!
//! - `control_plane`: a control-plane node from bare host to operator
//!   kubeconfigs and addons, including reruns on a dirty host
//! - `worker`: a worker racing the control plane, giving up at the
//!   discovery deadline, and refusing a wrong token without retrying
//!
//! Worker stories run with tokio's paused clock so retry backoff and the
//! discovery deadline elapse instantly.

mod control_plane;
mod helpers;
mod worker;

pub use crate::collective::{barrier, reduce_bytes, CollectiveId};
pub use crate::config::AppConfig;
pub use crate::envelope::{Envelope, MessageKind};
pub use crate::epoch::{EpochCategory, EpochT, make_epoch_collective, make_epoch_rooted, NO_EPOCH};
pub use crate::error::{vt_abort, vt_assert, VtError};
pub use crate::handler::{register_active_fn, AutoHandler, Functor, HandlerT};
pub use crate::message::{MessageBody, MsgPtr};
pub use crate::messenger::{current_messenger, ActiveMessenger};
pub use crate::net::{RecvdFrame, Tag, Transport};
pub use crate::node::{NodeT, UNINITIALIZED_DESTINATION};
pub use crate::pipe::{Callback, Lifetime, PipeId, PipeManager};
pub use crate::pool::Pool;
pub use crate::runnable::Runnable;
pub use crate::scheduler::Scheduler;
pub use crate::tree::Tree;
pub use serde_derive::{Deserialize, Serialize};

mod address;
mod collision;
mod concurrent;
mod link;
mod link_loss;
mod staleness;
mod startup_sync;
mod transfer;

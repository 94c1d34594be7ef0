pub mod botconfig;
pub mod repeat;

use crate::{Data, Error};

/// Every command the bot registers.
pub fn all() -> Vec<poise::Command<Data, Error>> {
    vec![repeat::repeat(), botconfig::botconfig()]
}

use shared::types::{AuthorizationView, Friend};
use crate::error::Result;

/// Splits an owner's friend list into authorized and denied friends for one
/// record.
///
/// Friends for which `is_known` is false have never been recorded by this
/// system and are left out of both lists. Input order is preserved; the
/// friend source guarantees unique ids so nothing is deduplicated here.
pub fn partition<K, G>(
    friends: Vec<Friend>,
    mut is_known: K,
    mut is_granted: G,
) -> Result<AuthorizationView>
where
    K: FnMut(&str) -> Result<bool>,
    G: FnMut(&str) -> Result<bool>,
{
    let mut view = AuthorizationView::default();

    for friend in friends {
        if !is_known(&friend.friend_id)? {
            continue;
        }
        if is_granted(&friend.friend_id)? {
            view.authorized_friends.push(friend);
        } else {
            view.denied_friends.push(friend);
        }
    }

    Ok(view)
}

use chrono::Utc;
use shared::{
    domain::{ListingId, UserId},
    error::CoreError,
    protocol::{CreateListingRequest, ListingPayload},
};
use storage::StoredListing;

use crate::ApiContext;

fn payload(listing: StoredListing) -> ListingPayload {
    ListingPayload {
        id: listing.id,
        creator_id: listing.creator_id,
        title: listing.title,
        description: listing.description,
        price: listing.price,
        location: listing.location,
        created_at: listing.created_at,
    }
}

pub async fn create_listing(
    ctx: &ApiContext,
    creator_id: UserId,
    request: &CreateListingRequest,
    location: &str,
) -> Result<ListingPayload, CoreError> {
    let listing = StoredListing {
        id: ListingId(ctx.sequencer.next_id()),
        creator_id,
        title: request.title.clone(),
        description: request.description.clone(),
        price: request.price,
        location: location.to_string(),
        created_at: Utc::now(),
    };
    ctx.storage.insert_listing(&listing).await?;
    Ok(payload(listing))
}

pub async fn listing(ctx: &ApiContext, id: ListingId) -> Result<ListingPayload, CoreError> {
    ctx.storage
        .listing_by_id(id)
        .await?
        .map(payload)
        .ok_or(CoreError::ListingNotFound)
}

pub async fn listings_for_user(
    ctx: &ApiContext,
    creator_id: UserId,
) -> Result<Vec<ListingPayload>, CoreError> {
    let listings = ctx.storage.listings_by_creator(creator_id).await?;
    Ok(listings.into_iter().map(payload).collect())
}

//! `/api/images`: read-only image catalog.

use serde_json::{json, Value};

use vdc_api_types::{api_err, keys, Image};
use vdc_rest_server::{ApiFuture, ApiHandler, ApiMethod, Router};

use super::take_param;
use crate::context::state;

pub static ROUTER: Router = Router::new()
    .get(&API_METHOD_LIST_IMAGES)
    .match_all("id", &ITEM_ROUTER);

static ITEM_ROUTER: Router = Router::new().get(&API_METHOD_READ_IMAGE);

static API_METHOD_LIST_IMAGES: ApiMethod = ApiMethod::new(&ApiHandler::Async(&list_images));
static API_METHOD_READ_IMAGE: ApiMethod = ApiMethod::new(&ApiHandler::Async(&read_image));

fn list_images(_param: Value) -> ApiFuture {
    Box::pin(async move {
        let images: Vec<Image> = state()
            .store
            .list_typed::<Image>(keys::IMAGE_PREFIX)?
            .into_iter()
            .map(|(image, _)| image)
            .collect();
        Ok(json!({ "data": images, "total": images.len() }))
    })
}

fn read_image(mut param: Value) -> ApiFuture {
    Box::pin(async move {
        let id = take_param(&mut param, "id")?;
        let Some((image, _)) = state().store.get_typed::<Image>(&keys::image(&id))? else {
            return Err(api_err!(NotFound, "no such image '{id}'"));
        };
        Ok(serde_json::to_value(&image)?)
    })
}

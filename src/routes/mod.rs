pub mod image_routes;

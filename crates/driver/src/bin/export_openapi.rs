// Export OpenAPI specification as JSON
//
// Usage: cargo run --bin export-openapi > docs/api/openapi.json

use rampart_driver::openapi::ApiDoc;

fn main() {
    println!("{}", ApiDoc::to_json());
}

#[rocket::launch]
fn rocket() -> _ {
    let rocket = import_server::rocket();
    log::info!("starting import server");
    rocket
}

//! End-to-end reflection over an in-memory channel pair.

use std::time::Duration;

use wicket_reflection::{LIST_SERVICES_PATH, ReflectionClient, method_path, register};
use wicket_session::{BoxError, CallOptions, Client, MemoryChannel, Server, make_handler};

fn ser_string(v: &String) -> Result<Vec<u8>, BoxError> {
    serde_json::to_vec(v).map_err(Into::into)
}

fn de_string(bytes: &[u8]) -> Result<String, BoxError> {
    serde_json::from_slice(bytes).map_err(Into::into)
}

fn options() -> CallOptions {
    CallOptions {
        timeout: Some(Duration::from_millis(1_000)),
        ..CallOptions::default()
    }
}

#[tokio::test]
async fn lists_registered_services_grouped_by_name() {
    let (near, far) = MemoryChannel::pair();
    let (client, client_driver) = Client::new(near);
    let (server, server_driver) = Server::new(far);
    tokio::spawn(client_driver.run());
    tokio::spawn(server_driver.run());

    let echo = make_handler(de_string, ser_string, |_ctx, req: String| async move { Ok(req) });
    server.register_handler(method_path("a.Svc", "One"), echo.clone());
    server.register_handler(method_path("a.Svc", "Two"), echo.clone());
    register(&server);

    let listed = ReflectionClient::new(client)
        .list_services(options())
        .await
        .unwrap();

    let svc = listed
        .services
        .iter()
        .find(|s| s.name == "a.Svc")
        .expect("a.Svc listed");
    assert_eq!(svc.methods, vec!["One", "Two"]);

    // The reflection method itself is a registration like any other.
    let reflection = listed
        .services
        .iter()
        .find(|s| s.name == "grpc.reflection.v1alpha.ServerReflection")
        .expect("reflection service listed");
    assert_eq!(reflection.methods, vec!["ListServices"]);
    assert_eq!(
        method_path(&reflection.name, &reflection.methods[0]),
        LIST_SERVICES_PATH
    );
}

#[tokio::test]
async fn reflects_methods_registered_after_install() {
    let (near, far) = MemoryChannel::pair();
    let (client, client_driver) = Client::new(near);
    let (server, server_driver) = Server::new(far);
    tokio::spawn(client_driver.run());
    tokio::spawn(server_driver.run());

    register(&server);
    server.register_handler(
        method_path("late.Svc", "Added"),
        make_handler(de_string, ser_string, |_ctx, req: String| async move { Ok(req) }),
    );

    let listed = ReflectionClient::new(client)
        .list_services(options())
        .await
        .unwrap();
    assert!(listed.services.iter().any(|s| s.name == "late.Svc"));
}

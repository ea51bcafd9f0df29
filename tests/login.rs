//! End-to-end exercise of the login-form extent through the public crate API only.

use std::cell::RefCell;
use std::rc::Rc;

use behavior_graph::Graph;

#[path = "../demos/login.rs"]
mod login;

#[test]
fn typing_valid_credentials_enables_login() {
    let graph = Graph::new();
    let ext = login::build(graph, |_, _| {});
    graph.action(None, move || ext.add_to_graph());
    let data = *ext.data();

    graph.action(None, move || {
        data.email.update_value("ada@example.com".to_string());
        data.password.update_value("hunter222".to_string());
    });

    assert!(data.email_valid.value());
    assert!(data.password_valid.value());
    assert!(data.login_enabled.value());
}

#[test]
fn invalid_password_keeps_login_disabled() {
    let graph = Graph::new();
    let ext = login::build(graph, |_, _| {});
    graph.action(None, move || ext.add_to_graph());
    let data = *ext.data();

    graph.action(None, move || {
        data.email.update_value("ada@example.com".to_string());
        data.password.update_value("short".to_string());
    });

    assert!(data.email_valid.value());
    assert!(!data.password_valid.value());
    assert!(!data.login_enabled.value());
}

#[test]
fn submitting_disables_login_until_complete() {
    let graph = Graph::new();
    let attempts: Rc<RefCell<Vec<(String, String)>>> = Rc::new(RefCell::new(Vec::new()));
    let recorder = attempts.clone();
    let ext = login::build(graph, move |email, password| {
        recorder.borrow_mut().push((email, password));
    });
    graph.action(None, move || ext.add_to_graph());
    let data = *ext.data();

    graph.action(None, move || {
        data.email.update_value("ada@example.com".to_string());
        data.password.update_value("hunter222".to_string());
    });
    assert!(data.login_enabled.value());

    graph.action(None, move || data.login_click.update());
    assert!(data.logging_in.value());
    assert!(!data.login_enabled.value());
    assert_eq!(
        attempts.borrow().as_slice(),
        &[("ada@example.com".to_string(), "hunter222".to_string())]
    );

    graph.action(None, move || data.login_click.update());
    assert_eq!(attempts.borrow().len(), 1, "a click while logging in must not resubmit");

    graph.action(None, move || data.complete_login(true));
    assert!(!data.logging_in.value());
    assert!(data.login_enabled.value());
}

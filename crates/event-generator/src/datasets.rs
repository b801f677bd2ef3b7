//! Static value pools for fake records.

pub const FIRST_NAMES: &[&str] = &[
    "Alice", "Bob", "Carol", "Dan", "Erin", "Frank", "Grace", "Heidi", "Ivan", "Judy", "Khalid",
    "Lena", "Mateo", "Nadia", "Oscar", "Priya", "Quinn", "Rosa", "Sven", "Tara",
];

pub const LAST_NAMES: &[&str] = &[
    "Smith", "Johnson", "Garcia", "Chen", "Novak", "Okafor", "Patel", "Kim", "Mueller", "Rossi",
    "Tanaka", "Ivanov", "Larsen", "Moreau", "Silva", "Haddad",
];

pub const COMPANIES: &[&str] = &[
    "Acme Corp", "Globex", "Initech", "Umbrella Labs", "Stark Industries", "Wayne Enterprises",
    "Wonka Industries", "Tyrell Corp", "Cyberdyne Systems", "Hooli",
];

pub const EMAIL_DOMAINS: &[&str] = &["example.com", "example.org", "mail.test", "corp.test"];

pub const ITEMS: &[&str] = &[
    "keyboard", "monitor", "desk lamp", "notebook", "webcam", "headset", "standing desk",
    "docking station", "usb hub", "office chair",
];
